//! Framed TCP ingest surface
//!
//! Requests and responses are postcard-encoded enums behind a
//! length-prefixed wire format:
//!
//! - 4 bytes: payload length (big-endian)
//! - N bytes: postcard payload
//!
//! The protocol deliberately carries no transport security or client
//! authentication; deployments front it with whatever the operator trusts.

use crate::config::Config;
use crate::service::{Bellrock, ServiceStats};
use bellrock_core::types::{ObservationBatch, SecretKey, Uid, UserLocation};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, warn};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("service error: {0}")]
    Service(String),
}

/// Ingest requests, one frame each.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Ping,
    RegisterUser,
    RegisterUsers(u32),
    RenewKey(Uid),
    DeleteUser(Uid),
    AddPeer(Uid, Uid),
    DeletePeer(Uid, Uid),
    AddLocations(Uid, Vec<UserLocation>),
    SubmitObservations(ObservationBatch),
    Stats,
}

/// Ingest responses, one frame each.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Registered(Uid, SecretKey),
    RegisteredMany(Vec<(Uid, SecretKey)>),
    KeyRenewed(SecretKey),
    Done,
    Resolved(u64),
    Stats(ServiceStats),
    Error(String),
}

/// Codec for length-prefixed postcard frames.
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Vec<u8>;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).to_vec()))
    }
}

impl Encoder<&[u8]> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(payload.len()));
        }
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }
}

/// The ingest server: accept loop plus one task per connection.
pub struct Server {
    config: Config,
    service: Arc<Bellrock>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Open the service and prepare the server.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let service =
            Arc::new(Bellrock::open(&config).map_err(|e| ServerError::Service(e.to_string()))?);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            service,
            shutdown_tx,
        })
    }

    /// The wrapped service, for in-process callers and tests.
    pub fn service(&self) -> &Arc<Bellrock> {
        &self.service
    }

    /// Sender half of the shutdown signal.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let commit_handle = self.service.spawn_commit_task();

        let listener = TcpListener::bind(&self.config.listen).await?;
        info!("listening on {}", self.config.listen);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("accepted connection from {addr}");
                            let service = self.service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(service, stream, addr).await {
                                    warn!("connection error from {addr}: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        commit_handle.abort();
        self.service.shutdown();
        self.service
            .flush()
            .map_err(|e| ServerError::Service(e.to_string()))?;

        Ok(())
    }
}

/// Serve one connection: decode frames, dispatch, answer. A malformed or
/// failing request becomes a `Response::Error` frame; only transport
/// failures terminate the connection.
async fn handle_connection(
    service: Arc<Bellrock>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    let mut codec = WireCodec;
    let mut inbound = BytesMut::with_capacity(8 * 1024);
    let mut outbound = BytesMut::new();

    loop {
        while let Some(payload) = codec.decode(&mut inbound)? {
            let response = match postcard::from_bytes::<Request>(&payload) {
                Ok(request) => dispatch(&service, request),
                Err(e) => Response::Error(format!("malformed request: {e}")),
            };

            let encoded = postcard::to_allocvec(&response).map_err(WireError::from)?;
            outbound.clear();
            codec.encode(&encoded, &mut outbound)?;
            stream.write_all(&outbound).await?;
        }

        if stream.read_buf(&mut inbound).await? == 0 {
            debug!("connection from {addr} closed");
            return Ok(());
        }
    }
}

fn dispatch(service: &Bellrock, request: Request) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::RegisterUser => match service.register_user() {
            Ok((uid, key)) => Response::Registered(uid, key),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::RegisterUsers(n) => match service.register_users(n as usize) {
            Ok(users) => Response::RegisteredMany(users),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::RenewKey(uid) => match service.renew_key(uid) {
            Ok(key) => Response::KeyRenewed(key),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::DeleteUser(uid) => done_or_error(service.delete_user(uid)),
        Request::AddPeer(a, b) => done_or_error(service.add_peer(a, b)),
        Request::DeletePeer(a, b) => done_or_error(service.delete_peer(a, b)),
        Request::AddLocations(uid, locations) => {
            done_or_error(service.add_locations(uid, locations))
        }
        Request::SubmitObservations(batch) => match service.submit_observations(batch) {
            Ok(count) => Response::Resolved(count as u64),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Stats => Response::Stats(service.stats()),
    }
}

fn done_or_error(result: bellrock_core::Result<()>) -> Response {
    match result {
        Ok(()) => Response::Done,
        Err(e) => Response::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellrock_core::towers::TowerMap;
    use bellrock_store::{Keystore, MasterKey, Store};
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = WireCodec;
        let payload = vec![1u8, 2, 3, 4, 5];

        let mut buf = BytesMut::new();
        codec.encode(&payload, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = WireCodec;
        let payload = vec![7u8; 32];

        let mut buf = BytesMut::new();
        codec.encode(&payload, &mut buf).unwrap();

        // Feed all but the last byte: not decodable yet.
        let last = buf.split_off(buf.len() - 1);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.unsplit(last);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), payload);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_slice(&[0; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::TooLarge(_))
        ));
    }

    #[test]
    fn test_request_roundtrip_through_postcard() {
        let request = Request::AddPeer(Uid::from_bytes([1; 8]), Uid::from_bytes([2; 8]));
        let bytes = postcard::to_allocvec(&request).unwrap();
        let decoded: Request = postcard::from_bytes(&bytes).unwrap();
        assert!(matches!(decoded, Request::AddPeer(a, b)
            if a == Uid::from_bytes([1; 8]) && b == Uid::from_bytes([2; 8])));
    }

    #[test]
    fn test_dispatch_register_and_stats() {
        let main_dir = tempdir().unwrap();
        let keys_dir = tempdir().unwrap();
        let service = Bellrock::new(
            Arc::new(Store::open(main_dir.path()).unwrap()),
            Arc::new(Keystore::open(keys_dir.path(), &MasterKey::derive(b"test")).unwrap()),
            Arc::new(TowerMap::new()),
            NonZeroUsize::new(10).unwrap(),
            1,
            64,
            Duration::from_secs(5),
        )
        .unwrap();

        let response = dispatch(&service, Request::RegisterUser);
        let Response::Registered(uid, _key) = response else {
            panic!("expected Registered, got {response:?}");
        };

        let response = dispatch(&service, Request::Stats);
        let Response::Stats(stats) = response else {
            panic!("expected Stats, got {response:?}");
        };
        assert_eq!(stats.users, 1);

        let response = dispatch(&service, Request::DeleteUser(uid));
        assert!(matches!(response, Response::Done));
    }
}
