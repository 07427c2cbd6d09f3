use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tracing::trace;

use super::MsgHandler;
use crate::network::Connection;
use crate::AppResult;

pub const MSG_ID_HELLO_REQ: u16 = 100;
pub const MSG_ID_HELLO_ACK: u16 = 101;

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReq {
    #[prost(bytes = "vec", tag = "1")]
    pub hello: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloAck {
    #[prost(bytes = "vec", tag = "1")]
    pub word: Vec<u8>,
}

/// Replies to every `HelloReq` with a `HelloAck` carrying `hello + "world"`.
pub struct EchoHandler;

#[async_trait]
impl MsgHandler for EchoHandler {
    async fn handle(
        &self,
        conn: &Arc<Connection>,
        _msg_id: u16,
        body: Bytes,
        _len: usize,
    ) -> AppResult<()> {
        let request = HelloReq::decode(body)?;
        trace!("connection {} hello: {:?}", conn.id(), request.hello);

        let mut word = request.hello;
        word.extend_from_slice(b"world");
        conn.send(MSG_ID_HELLO_ACK, &HelloAck { word }).await
    }
}
