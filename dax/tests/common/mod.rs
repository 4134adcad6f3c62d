use dax::prelude::*;
use tokio::net::TcpListener;

/// Boot a server on an ephemeral port and return it with the port.
pub async fn spawn_server() -> (Server, u16) {
    let server = Server::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept = server.clone();
    tokio::spawn(async move {
        let _ = accept.serve(listener).await;
    });
    (server, port)
}

#[allow(dead_code)]
pub async fn connect(name: &str, port: u16) -> Session {
    SessionOptions::new(name)
        .port(port)
        .connect()
        .await
        .unwrap()
}
