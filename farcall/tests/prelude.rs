//! The facade's prelude is enough to assemble and drive a server.

use farcall::prelude::*;

#[tokio::test]
async fn prelude_builds_a_working_server() {
    let server = Server::builder(ServerConfig::default())
        .service(Service::new("Echo").method("Say", |text: String| async move {
            Ok::<_, MethodError>(text)
        }))
        .build();

    let responses = server
        .process(
            br#"[{"id":"1","name":"Echo.Say","args":["hi"]}]"#,
            CallContext::new(),
        )
        .await;
    let out = serde_json::to_value(&responses).unwrap();
    assert_eq!(
        out,
        serde_json::json!([{"id": "1", "data": "hi", "error": ""}])
    );
}
