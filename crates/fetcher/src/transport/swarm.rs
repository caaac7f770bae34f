use super::{AuthConfig, PeerConnection, PeerTransport};
use crate::config::MAX_BLOCK_SIZE_POWER;
use crate::error::{FetchError, Result as FetchResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use libp2p::{
    identity, noise,
    request_response::{
        self, Behaviour as RequestResponse, Codec as RequestResponseCodec,
        Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
    },
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol,
};
use peerfs_protocol::{BlockCommand, BlockReply, PingRequest, ReadBlockRequest, BLOCK_PROTOCOL};
use std::collections::HashMap;
use std::{io, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 256;
const MAX_REQUEST_BYTES: u64 = 64 * 1024;
/// Room for the reply envelope around the block data: key, signature, lengths.
const REPLY_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Bincode framing for the block protocol, one message per substream.
///
/// Inbound messages are capped: requests at a fixed size, replies at the
/// largest block this side asks for plus envelope overhead.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    max_reply_bytes: u64,
}

impl BlockCodec {
    pub fn new(max_block_size: usize) -> Self {
        Self {
            max_reply_bytes: max_block_size as u64 + REPLY_OVERHEAD_BYTES,
        }
    }
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self::new(1 << MAX_BLOCK_SIZE_POWER)
    }
}

async fn read_capped<T>(io: &mut T, limit: u64) -> io::Result<Vec<u8>>
where
    T: futures::AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    let mut limited = futures::AsyncReadExt::take(io, limit + 1);
    futures::AsyncReadExt::read_to_end(&mut limited, &mut buf).await?;
    if buf.len() as u64 > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message exceeds {limit} bytes"),
        ));
    }
    Ok(buf)
}

#[async_trait]
impl RequestResponseCodec for BlockCodec {
    type Protocol = StreamProtocol;
    type Request = BlockCommand;
    type Response = BlockReply;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        let buf = read_capped(io, MAX_REQUEST_BYTES).await?;
        bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        let buf = read_capped(io, self.max_reply_bytes).await?;
        bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: BlockCommand,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        let data = bincode::serialize(&request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        futures::AsyncWriteExt::write_all(io, &data).await?;
        futures::AsyncWriteExt::close(io).await?;
        Ok(())
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: BlockReply,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        let data = bincode::serialize(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        futures::AsyncWriteExt::write_all(io, &data).await?;
        futures::AsyncWriteExt::close(io).await?;
        Ok(())
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "FetchEvent")]
struct FetchBehaviour {
    block: RequestResponse<BlockCodec>,
}

fn fetch_behaviour(
    codec: BlockCodec,
    support: request_response::ProtocolSupport,
    request_timeout: Duration,
) -> FetchBehaviour {
    FetchBehaviour {
        block: RequestResponse::with_codec(
            codec,
            std::iter::once((StreamProtocol::new(BLOCK_PROTOCOL), support)),
            request_response::Config::default().with_request_timeout(request_timeout),
        ),
    }
}

#[derive(Debug)]
enum FetchEvent {
    Block(RequestResponseEvent<BlockCommand, BlockReply>),
}

impl From<RequestResponseEvent<BlockCommand, BlockReply>> for FetchEvent {
    fn from(v: RequestResponseEvent<BlockCommand, BlockReply>) -> Self {
        Self::Block(v)
    }
}

enum SwarmCommand {
    Dial {
        peer_id: PeerId,
        address: Multiaddr,
        reply: oneshot::Sender<FetchResult<()>>,
    },
    Request {
        peer_id: PeerId,
        command: BlockCommand,
        reply: oneshot::Sender<FetchResult<BlockReply>>,
    },
}

/// libp2p client transport (tcp + noise + yamux) speaking the block protocol.
///
/// The swarm runs on a background task; connections are thin handles that
/// submit commands to it. Dropping every handle stops the task.
#[derive(Clone)]
pub struct SwarmTransport {
    commands: mpsc::Sender<SwarmCommand>,
    local_peer_id: PeerId,
    connect_timeout: Duration,
}

impl SwarmTransport {
    /// Starts the swarm driver. `max_block_size` bounds the replies accepted.
    pub fn spawn(
        keypair: identity::Keypair,
        max_block_size: usize,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> FetchResult<Self> {
        let local_peer_id = keypair.public().to_peer_id();
        let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| FetchError::Protocol(format!("tcp/noise init failed: {e}")))?
            .with_behaviour(|_| {
                fetch_behaviour(
                    BlockCodec::new(max_block_size),
                    request_response::ProtocolSupport::Outbound,
                    request_timeout,
                )
            })
            .map_err(|e| FetchError::Protocol(format!("fetch behaviour init failed: {e}")))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(drive_swarm(swarm, rx));
        info!(peer_id = %local_peer_id, "Swarm transport started");

        Ok(Self {
            commands,
            local_peer_id,
            connect_timeout,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

#[async_trait]
impl PeerTransport for SwarmTransport {
    async fn connect(&self, address: &str, auth: &AuthConfig) -> FetchResult<Arc<dyn PeerConnection>> {
        let multiaddr: Multiaddr = address
            .parse()
            .map_err(|e| FetchError::connection(address, e))?;
        let peer_id = extract_peer_id(&multiaddr)
            .ok_or_else(|| FetchError::connection(address, "address missing /p2p/ peer id"))?;

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::Dial {
                peer_id,
                address: multiaddr,
                reply,
            })
            .await
            .map_err(|_| FetchError::connection(address, "swarm driver stopped"))?;
        match tokio::time::timeout(self.connect_timeout, rx).await {
            Err(_) => return Err(FetchError::connection(address, "connect timed out")),
            Ok(Err(_)) => return Err(FetchError::connection(address, "swarm driver stopped")),
            Ok(Ok(dialed)) => dialed?,
        }

        let connection = SwarmConnection {
            peer_id,
            address: address.to_string(),
            expected_name: auth.expected_name.clone(),
            commands: self.commands.clone(),
        };
        // Noise has authenticated the peer id; the handshake ping checks the node name.
        connection.ping().await?;
        Ok(Arc::new(connection))
    }
}

struct SwarmConnection {
    peer_id: PeerId,
    address: String,
    expected_name: String,
    commands: mpsc::Sender<SwarmCommand>,
}

impl SwarmConnection {
    async fn request(&self, command: BlockCommand) -> FetchResult<BlockReply> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::Request {
                peer_id: self.peer_id,
                command,
                reply,
            })
            .await
            .map_err(|_| FetchError::connection(&self.address, "swarm driver stopped"))?;
        rx.await
            .map_err(|_| FetchError::connection(&self.address, "swarm driver stopped"))?
    }
}

#[async_trait]
impl PeerConnection for SwarmConnection {
    async fn ping(&self) -> FetchResult<()> {
        match self.request(BlockCommand::Ping(PingRequest::default())).await? {
            BlockReply::Ping(pong) => {
                if !self.expected_name.is_empty() && pong.name != self.expected_name {
                    return Err(FetchError::connection(
                        &self.address,
                        format!(
                            "peer authenticated as {:?}, expected {:?}",
                            pong.name, self.expected_name
                        ),
                    ));
                }
                Ok(())
            }
            BlockReply::Error(err) => Err(FetchError::Protocol(err.message)),
            BlockReply::Read(_) => Err(FetchError::Protocol(
                "unexpected read reply to ping".to_string(),
            )),
        }
    }

    async fn read_block(&self, hash: &str, offset: u64, len: usize) -> FetchResult<Bytes> {
        let command = BlockCommand::Read(ReadBlockRequest {
            hash: hash.to_string(),
            offset,
            size: len as u64,
        });
        match self.request(command).await? {
            BlockReply::Read(reply) => {
                if !reply.found {
                    return Err(FetchError::Protocol(format!(
                        "{} does not hold {hash}",
                        self.address
                    )));
                }
                if !reply.verify_proof(hash, offset) || reply.signer() != Some(self.peer_id) {
                    return Err(FetchError::Protocol(format!(
                        "{} sent an unverifiable reply for {hash}@{offset}",
                        self.address
                    )));
                }
                Ok(Bytes::from(reply.data))
            }
            BlockReply::Error(err) => Err(FetchError::Protocol(err.message)),
            BlockReply::Ping(_) => Err(FetchError::Protocol(
                "unexpected ping reply to read".to_string(),
            )),
        }
    }
}

async fn drive_swarm(mut swarm: Swarm<FetchBehaviour>, mut commands: mpsc::Receiver<SwarmCommand>) {
    let mut dials: HashMap<PeerId, Vec<oneshot::Sender<FetchResult<()>>>> = HashMap::new();
    let mut inflight: HashMap<OutboundRequestId, oneshot::Sender<FetchResult<BlockReply>>> =
        HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All swarm transport handles dropped, stopping driver");
                    break;
                };
                match command {
                    SwarmCommand::Dial { peer_id, address, reply } => {
                        if swarm.is_connected(&peer_id) {
                            let _ = reply.send(Ok(()));
                        } else {
                            swarm.add_peer_address(peer_id, address.clone());
                            match swarm.dial(address.clone()) {
                                Ok(()) => dials.entry(peer_id).or_default().push(reply),
                                Err(e) => {
                                    let _ = reply.send(Err(FetchError::connection(address.to_string(), e)));
                                }
                            }
                        }
                    }
                    SwarmCommand::Request { peer_id, command, reply } => {
                        let request_id = swarm.behaviour_mut().block.send_request(&peer_id, command);
                        inflight.insert(request_id, reply);
                    }
                }
            }
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(FetchEvent::Block(event)) => match event {
                    RequestResponseEvent::Message {
                        message: RequestResponseMessage::Response { request_id, response },
                        ..
                    } => {
                        if let Some(reply) = inflight.remove(&request_id) {
                            let _ = reply.send(Ok(response));
                        }
                    }
                    RequestResponseEvent::OutboundFailure { peer, request_id, error, .. } => {
                        warn!(peer = %peer, error = %error, "Block request failed");
                        if let Some(reply) = inflight.remove(&request_id) {
                            let _ = reply.send(Err(FetchError::connection(peer.to_string(), error)));
                        }
                    }
                    _ => {}
                },
                SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                    info!(peer = %peer_id, endpoint = ?endpoint, "Connection established");
                    for reply in dials.remove(&peer_id).unwrap_or_default() {
                        let _ = reply.send(Ok(()));
                    }
                }
                SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                    warn!(peer = %peer_id, error = %error, "Outgoing connection error");
                    for reply in dials.remove(&peer_id).unwrap_or_default() {
                        let _ = reply.send(Err(FetchError::connection(peer_id.to_string(), &error)));
                    }
                }
                SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                    info!(peer = %peer_id, cause = ?cause, "Connection closed");
                }
                _ => {}
            }
        }
    }
}

fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use libp2p::multiaddr::Protocol;
    use peerfs_protocol::{PingResponse, ReadBlockResponse};

    /// Serves `data` under any hash, answering pings as `name` and signing
    /// read replies with `signer`. Returns the dialable address.
    async fn spawn_responder(
        keypair: identity::Keypair,
        name: &str,
        data: Vec<u8>,
        signer: identity::Keypair,
    ) -> Multiaddr {
        let peer_id = keypair.public().to_peer_id();
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .unwrap()
            .with_behaviour(|_| {
                fetch_behaviour(
                    BlockCodec::default(),
                    request_response::ProtocolSupport::Inbound,
                    Duration::from_secs(5),
                )
            })
            .unwrap()
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();
        swarm
            .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .unwrap();

        let address = loop {
            if let SwarmEvent::NewListenAddr { address, .. } = swarm.select_next_some().await {
                break address;
            }
        };

        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                if let SwarmEvent::Behaviour(FetchEvent::Block(RequestResponseEvent::Message {
                    message: RequestResponseMessage::Request { request, channel, .. },
                    ..
                })) = swarm.select_next_some().await
                {
                    let reply = match request {
                        BlockCommand::Ping(_) => BlockReply::Ping(PingResponse {
                            name: name.clone(),
                            timestamp_ms: 1,
                        }),
                        BlockCommand::Read(read) => {
                            let start = (read.offset as usize).min(data.len());
                            let end = (start + read.size as usize).min(data.len());
                            BlockReply::Read(ReadBlockResponse::signed(
                                &signer,
                                &read.hash,
                                read.offset,
                                data[start..end].to_vec(),
                                1,
                            ))
                        }
                    };
                    let _ = swarm.behaviour_mut().block.send_response(channel, reply);
                }
            }
        });

        address.with(Protocol::P2p(peer_id))
    }

    fn auth(name: &str) -> AuthConfig {
        AuthConfig {
            expected_name: name.to_string(),
        }
    }

    #[test]
    fn peer_id_is_taken_from_p2p_suffix() {
        let peer = PeerId::from(identity::Keypair::generate_ed25519().public());
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/9000/p2p/{peer}").parse().unwrap();
        assert_eq!(extract_peer_id(&addr), Some(peer));

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/9000".parse().unwrap();
        assert_eq!(extract_peer_id(&bare), None);
    }

    #[test]
    fn codec_carries_signed_read_reply() {
        let keypair = identity::Keypair::generate_ed25519();
        let protocol = StreamProtocol::new(BLOCK_PROTOCOL);
        let reply = BlockReply::Read(ReadBlockResponse::signed(
            &keypair,
            "cafe",
            8192,
            vec![5u8; 100],
            11,
        ));

        futures::executor::block_on(async {
            let mut codec = BlockCodec::default();
            let mut wire = Cursor::new(Vec::new());
            codec
                .write_response(&protocol, &mut wire, reply)
                .await
                .expect("write response");

            let mut wire = Cursor::new(wire.into_inner());
            match codec.read_response(&protocol, &mut wire).await.expect("read response") {
                BlockReply::Read(read) => {
                    assert_eq!(read.data.len(), 100);
                    assert!(read.verify_proof("cafe", 8192));
                    assert_eq!(read.signer(), Some(keypair.public().to_peer_id()));
                }
                other => panic!("unexpected reply {other:?}"),
            }
        });
    }

    #[test]
    fn codec_rejects_garbage() {
        let protocol = StreamProtocol::new(BLOCK_PROTOCOL);
        futures::executor::block_on(async {
            let mut codec = BlockCodec::default();
            let mut wire = Cursor::new(vec![0xff; 3]);
            let err = codec
                .read_request(&protocol, &mut wire)
                .await
                .expect_err("garbage must not decode");
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        });
    }

    #[test]
    fn codec_refuses_oversized_reply() {
        let keypair = identity::Keypair::generate_ed25519();
        let protocol = StreamProtocol::new(BLOCK_PROTOCOL);
        let reply = BlockReply::Read(ReadBlockResponse::signed(
            &keypair,
            "cafe",
            0,
            vec![1u8; 4096 + REPLY_OVERHEAD_BYTES as usize + 1],
            11,
        ));

        futures::executor::block_on(async {
            let mut wire = Cursor::new(Vec::new());
            BlockCodec::default()
                .write_response(&protocol, &mut wire, reply)
                .await
                .expect("write response");

            let mut wire = Cursor::new(wire.into_inner());
            let err = BlockCodec::new(4096)
                .read_response(&protocol, &mut wire)
                .await
                .expect_err("reply larger than the cap must be refused");
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        });
    }

    #[tokio::test]
    async fn swarm_transport_reads_and_checks_peers() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let server_key = identity::Keypair::generate_ed25519();
        let honest = spawn_responder(server_key.clone(), "alice", data.clone(), server_key).await;
        let forged = spawn_responder(
            identity::Keypair::generate_ed25519(),
            "bob",
            data.clone(),
            identity::Keypair::generate_ed25519(),
        )
        .await;

        let client = SwarmTransport::spawn(
            identity::Keypair::generate_ed25519(),
            4096,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .expect("client swarm");

        let conn = client
            .connect(&honest.to_string(), &auth("alice"))
            .await
            .expect("connect to alice");
        let block = conn.read_block("cafe", 4096, 4096).await.expect("read block 1");
        assert_eq!(&block[..], &data[4096..8192]);

        let Err(err) = client.connect(&honest.to_string(), &auth("mallory")).await else {
            panic!("wrong node name must be refused");
        };
        assert!(matches!(err, FetchError::Connection { .. }), "got {err:?}");

        let conn = client
            .connect(&forged.to_string(), &auth("bob"))
            .await
            .expect("connect to bob");
        let err = conn.read_block("cafe", 0, 4096).await.unwrap_err();
        assert!(matches!(err, FetchError::Protocol(_)), "got {err:?}");
    }
}
