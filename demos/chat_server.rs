use async_trait::async_trait;
use log::*;
use socket_mesh::frame::{CloseCode, ClosePayload};
use socket_mesh::message::Message;
use socket_mesh::server::WebSocketServer;
use socket_mesh::service::{SessionHandle, WebSocketBehavior};

// Every message a member sends is repeated to the whole room.
struct Chat;

#[async_trait]
impl WebSocketBehavior for Chat {
    async fn on_open(&mut self, session: &SessionHandle) {
        info!("session {} joined the chat", session.id());
    }

    async fn on_message(&mut self, session: &SessionHandle, message: Message) {
        if let Message::Text(text) = message {
            session.sessions().broadcast_text(text).await;
        }
    }

    async fn on_close(&mut self, session: &SessionHandle, close: Option<&ClosePayload>) {
        let code = close.map(|payload| payload.code).unwrap_or(CloseCode::NO_STATUS);
        info!("session {} left the chat with status {}", session.id(), code);
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let server = WebSocketServer::new(None);
    server.add_service("/chat", || Box::new(Chat));

    server.start(9002).await.expect("Can't start the server");
    info!("chat service running on ws://127.0.0.1:9002/chat");

    tokio::signal::ctrl_c().await.ok();
    server.stop(CloseCode::AWAY, "server shutting down").await;
}
