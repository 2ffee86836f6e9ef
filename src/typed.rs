//! Typed channel binding over an untyped exchange session.

use std::any::type_name;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use crate::frame::type_code;
use crate::session::{ExchangeConfig, ExchangeSession};

/// A strongly typed exchange channel for one payload type.
///
/// Binding derives the session's exchange code from `T`'s runtime type
/// identifier (CRC32, truncated to i32), so several logically distinct
/// channels can multiplex over one transport without negotiation —
/// frames for other types simply fail the code check. Collisions over
/// 32 bits are accepted. The wire format is unchanged.
pub struct TypedExchange<T, C: Codec = JsonCodec> {
    session: ExchangeSession<C>,
    _payload: PhantomData<fn(T) -> T>,
}

impl<T, C> TypedExchange<T, C>
where
    T: Serialize + DeserializeOwned,
    C: Codec + 'static,
{
    /// Bind a session to payload type `T`, overriding its exchange code.
    pub fn bind(session: ExchangeSession<C>) -> Result<Self> {
        session.set_exchange_code(type_code(type_name::<T>()))?;
        Ok(Self {
            session,
            _payload: PhantomData,
        })
    }

    /// The per-type exchange code this channel uses.
    pub fn exchange_code(&self) -> i32 {
        self.session.exchange_code()
    }

    /// Send one `T`. Failures are swallowed into the return value.
    pub async fn send(&self, value: &T) -> bool {
        self.session.send_object(value).await
    }

    /// Receive one `T` outside the receive loop.
    ///
    /// `Ok(None)` when no frame is available (`wait = false`), or when a
    /// frame arrived but was not for this channel (foreign exchange code
    /// or undecodable payload).
    pub async fn receive(&self, wait: bool) -> Result<Option<T>> {
        match self.session.receive_object(wait).await? {
            Some(received) if received.is_deserialized() => {
                Ok(received.decode_with(self.session.codec()).ok())
            }
            _ => Ok(None),
        }
    }

    /// The untyped session underneath.
    pub fn session(&self) -> &ExchangeSession<C> {
        &self.session
    }

    /// Consume the binding and return the session.
    pub fn into_inner(self) -> ExchangeSession<C> {
        self.session
    }
}

impl<T> TypedExchange<T, JsonCodec>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a typed server session bound to `local`.
    pub async fn create_server(local: SocketAddr) -> Result<Self> {
        Self::bind(ExchangeSession::create_server(local).await?)
    }

    /// Create a typed client session with no stream attached yet.
    pub fn create_client() -> Result<Self> {
        Self::bind(ExchangeSession::create_client()?)
    }

    /// Create a typed client session and connect it to `remote`.
    ///
    /// A failed connect still returns the channel, with the session in
    /// the `TIMEOUT` state.
    pub async fn connect_client(remote: SocketAddr, timeout: Duration) -> Result<Self> {
        let channel = Self::create_client()?;
        channel.session.connect(remote, timeout).await?;
        Ok(channel)
    }

    /// Create a typed server session with explicit configuration.
    ///
    /// The configured exchange code is replaced by the per-type code.
    pub async fn create_server_with(local: SocketAddr, config: ExchangeConfig) -> Result<Self> {
        Self::bind(ExchangeSession::create_server_with(local, config, JsonCodec).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_EXCHANGE_CODE;
    use serde::Deserialize;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
        echoed: bool,
    }

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (server, _) = listener.accept().await.unwrap();
        let client = client.await.unwrap().unwrap();

        (server, client)
    }

    #[tokio::test]
    async fn test_binding_derives_type_code() {
        let channel = TypedExchange::<Ping>::create_client().unwrap();

        assert_eq!(channel.exchange_code(), type_code(type_name::<Ping>()));
        assert_ne!(channel.exchange_code(), DEFAULT_EXCHANGE_CODE);

        let other = TypedExchange::<Pong>::create_client().unwrap();
        assert_ne!(channel.exchange_code(), other.exchange_code());
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let (a, b) = stream_pair().await;
        let a = TypedExchange::<Ping>::bind(ExchangeSession::from_stream(a, true).unwrap())
            .unwrap();
        let b = TypedExchange::<Ping>::bind(ExchangeSession::from_stream(b, true).unwrap())
            .unwrap();

        let ping = Ping { seq: 41 };
        assert!(a.send(&ping).await);

        let received = timeout(Duration::from_secs(5), b.receive(true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Some(ping));
    }

    #[tokio::test]
    async fn test_type_isolation() {
        let (a, b) = stream_pair().await;
        let sender = TypedExchange::<Ping>::bind(ExchangeSession::from_stream(a, true).unwrap())
            .unwrap();
        let receiver = TypedExchange::<Pong>::bind(ExchangeSession::from_stream(b, true).unwrap())
            .unwrap();

        assert!(sender.send(&Ping { seq: 1 }).await);

        // The Ping frame is a complete read on the Pong channel, but its
        // exchange code does not match: no object.
        let received = timeout(Duration::from_secs(5), receiver.receive(true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, None);

        // Rebinding the receiving session to the matching type accepts
        // the next frame.
        let receiver = TypedExchange::<Ping>::bind(receiver.into_inner()).unwrap();
        assert!(sender.send(&Ping { seq: 2 }).await);

        let received = timeout(Duration::from_secs(5), receiver.receive(true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Some(Ping { seq: 2 }));
    }

    #[tokio::test]
    async fn test_typed_end_to_end_listening() {
        let server = TypedExchange::<Ping>::create_server("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.session().local_addr().unwrap();

        server.session().start_listening(true).unwrap();
        let mut objects = server.session().subscribe_objects();

        let client = TypedExchange::<Ping>::connect_client(addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(client.session().state().is_connected());

        assert!(client.send(&Ping { seq: 9 }).await);

        let received = timeout(Duration::from_secs(5), objects.recv())
            .await
            .unwrap()
            .unwrap();
        let ping: Ping = received.decode_with(&JsonCodec).unwrap();
        assert_eq!(ping, Ping { seq: 9 });

        client.session().close().await;
        server.session().close().await;
    }
}
