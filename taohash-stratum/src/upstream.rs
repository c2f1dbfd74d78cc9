use crate::{
    config::PoolDescriptor,
    error::{Result, StratumError},
    protocol::{self, StratumMessage, StratumRequest},
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// How long to wait for the pool to answer `mining.configure`. Legacy
/// upstreams never answer; the timeout is how they are detected.
const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the authorize response plus the first job.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on messages read between authorize and the first post-auth job.
const MAX_PRE_AUTH_MESSAGES: usize = 10;

/// A connected, subscribed, and authorized session with an upstream pool.
///
/// `connect` performs the whole handshake: optional `mining.configure`
/// negotiation, `mining.subscribe`, `mining.authorize`, and a bounded read of
/// the messages the pool pushes right after authorization. Those buffered
/// messages typically hold the initial `mining.set_difficulty` and
/// `mining.notify`; they are left unconsumed here so the miner session can
/// replay them once its own client authorizes, letting the miner start on the
/// first job without another round trip to the pool.
#[derive(Debug)]
pub struct UpstreamSession {
    framed: Option<Framed<TcpStream, LinesCodec>>,
    next_id: u64,

    /// Subscription id list returned by the pool on subscribe
    pub subscription_ids: Value,

    /// Extranonce1 assigned by the pool
    pub extranonce1: String,

    /// Extranonce2 size required by the pool
    pub extranonce2_size: u64,

    /// Cached `mining.configure` result, `None` when no configure was sent or
    /// the pool never replied within the timeout
    pub configure_response: Option<Value>,

    /// Messages received between authorize and the first post-auth job,
    /// buffered verbatim for the miner session to replay
    pub pre_auth_messages: Vec<StratumMessage>,
}

impl UpstreamSession {
    /// Connect to `pool` and run the full Stratum handshake.
    pub async fn connect(
        pool: &PoolDescriptor,
        configure_request: Option<&StratumRequest>,
        user_agent: &str,
    ) -> Result<Self> {
        let addr = pool.endpoint();
        info!("Connecting to pool at {} with user {}", addr, pool.user);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| StratumError::Connect(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| StratumError::Connect(format!("{addr}: {e}")))?;

        let mut framed = Framed::new(stream, LinesCodec::new());
        let mut next_id: u64 = 1;

        let configure_response = match configure_request {
            Some(request) => Self::negotiate_configure(&mut framed, request).await?,
            None => None,
        };

        let (subscription_ids, extranonce1, extranonce2_size) =
            Self::subscribe(&mut framed, &mut next_id, user_agent).await?;

        let pre_auth_messages = Self::authorize(&mut framed, &mut next_id, pool).await?;

        info!(
            "Pool handshake complete: extranonce1={}, extranonce2_size={}",
            extranonce1, extranonce2_size
        );

        Ok(Self {
            framed: Some(framed),
            next_id,
            subscription_ids,
            extranonce1,
            extranonce2_size,
            configure_response,
            pre_auth_messages,
        })
    }

    /// Allocate the next request id on this upstream connection.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Hand the framed TCP stream over to the caller. Returns `None` if it
    /// was already taken.
    pub fn take_stream(&mut self) -> Option<Framed<TcpStream, LinesCodec>> {
        self.framed.take()
    }

    /// Forward the miner's `mining.configure` and wait briefly for an answer.
    ///
    /// Returns the cached `result` object, or `None` when the pool stayed
    /// silent, which marks it as a legacy upstream without version-rolling
    /// support.
    async fn negotiate_configure(
        framed: &mut Framed<TcpStream, LinesCodec>,
        request: &StratumRequest,
    ) -> Result<Option<Value>> {
        framed.send(serde_json::to_string(request)?).await?;
        debug!("Sent mining.configure to pool: {}", request);

        match timeout(CONFIGURE_TIMEOUT, framed.next()).await {
            Ok(Some(line)) => {
                let line = line?;
                match protocol::parse_line(&line) {
                    Ok(StratumMessage::Response(resp)) if resp.id == request.id => {
                        debug!("Configure response result: {:?}", resp.result);
                        Ok(resp.result)
                    }
                    Ok(other) => {
                        warn!(
                            "Configure response id mismatch: expected {:?}, got {:?}",
                            request.id,
                            other.id()
                        );
                        Ok(None)
                    }
                    Err(e) => {
                        warn!("Malformed configure response from pool: {}", e);
                        Ok(None)
                    }
                }
            }
            Ok(None) => Err(StratumError::Connect(
                "pool closed connection during configure".to_string(),
            )),
            Err(_) => {
                debug!("No mining.configure response within 2s, assuming legacy upstream");
                Ok(None)
            }
        }
    }

    /// Send `mining.subscribe` and parse the pool's reply into
    /// `(subscription_ids, extranonce1, extranonce2_size)`.
    async fn subscribe(
        framed: &mut Framed<TcpStream, LinesCodec>,
        next_id: &mut u64,
        user_agent: &str,
    ) -> Result<(Value, String, u64)> {
        let id = Self::alloc_id(next_id);
        let request = StratumRequest::subscribe(id, user_agent);
        framed.send(serde_json::to_string(&request)?).await?;
        debug!("Sent subscription request with id {}", id);

        let line = match timeout(AUTH_TIMEOUT, framed.next()).await {
            Ok(Some(line)) => line?,
            Ok(None) => {
                return Err(StratumError::HandshakeTimeout(
                    "pool closed connection before subscribe response".to_string(),
                ))
            }
            Err(_) => {
                return Err(StratumError::HandshakeTimeout(
                    "no subscribe response from pool".to_string(),
                ))
            }
        };

        let response = match protocol::parse_line(&line) {
            Ok(StratumMessage::Response(resp)) => resp,
            _ => {
                return Err(StratumError::HandshakeTimeout(
                    "expected subscribe response, got something else".to_string(),
                ))
            }
        };

        let result = response.result.ok_or_else(|| {
            StratumError::HandshakeTimeout("subscribe response carried no result".to_string())
        })?;
        let parts = result.as_array().ok_or_else(|| {
            StratumError::HandshakeTimeout("subscribe result is not an array".to_string())
        })?;

        let subscription_ids = parts.first().cloned().ok_or_else(|| {
            StratumError::HandshakeTimeout("subscribe result missing subscription ids".to_string())
        })?;
        let extranonce1 = parts
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StratumError::HandshakeTimeout("subscribe result missing extranonce1".to_string())
            })?
            .to_string();
        let extranonce2_size = parts.get(2).and_then(Value::as_u64).ok_or_else(|| {
            StratumError::HandshakeTimeout("subscribe result missing extranonce2_size".to_string())
        })?;

        let extranonce1_bytes = hex::decode(&extranonce1)
            .map(|b| b.len())
            .unwrap_or_default();
        debug!(
            "Subscription successful: extranonce1={} ({} bytes), extranonce2_size={}",
            extranonce1, extranonce1_bytes, extranonce2_size
        );

        Ok((subscription_ids, extranonce1, extranonce2_size))
    }

    /// Send `mining.authorize` and read until the authorize response plus at
    /// least one further message has been seen, buffering everything.
    async fn authorize(
        framed: &mut Framed<TcpStream, LinesCodec>,
        next_id: &mut u64,
        pool: &PoolDescriptor,
    ) -> Result<Vec<StratumMessage>> {
        let id = Self::alloc_id(next_id);
        let request = StratumRequest::authorize(id, &pool.user, &pool.pass);
        framed.send(serde_json::to_string(&request)?).await?;
        debug!("Sent authorization request with id {}", id);

        let auth_id = Value::from(id);
        let mut pre_auth_messages: Vec<StratumMessage> = Vec::new();
        let mut authorize_error: Option<Option<Value>> = None;

        while pre_auth_messages.len() < MAX_PRE_AUTH_MESSAGES {
            match timeout(AUTH_TIMEOUT, framed.next()).await {
                Ok(Some(line)) => {
                    let line = line?;
                    let message = match protocol::parse_line(&line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Malformed line from pool during authorization: {}", e);
                            continue;
                        }
                    };

                    if let StratumMessage::Response(resp) = &message {
                        if resp.id.as_ref() == Some(&auth_id) {
                            authorize_error = Some(resp.error.clone());
                        }
                    }
                    pre_auth_messages.push(message);

                    if matches!(authorize_error, Some(Some(_))) {
                        break;
                    }

                    // Stop after auth response + one more message (the
                    // initial job in practice).
                    if authorize_error.is_some() && pre_auth_messages.len() > 1 {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    if authorize_error.is_some() {
                        warn!("Timeout waiting for initial job, proceeding anyway");
                        break;
                    }
                    return Err(StratumError::HandshakeTimeout(
                        "no authorization response from pool".to_string(),
                    ));
                }
            }
        }

        match authorize_error {
            None => Err(StratumError::HandshakeTimeout(
                "pool never answered the authorization request".to_string(),
            )),
            Some(Some(error)) => Err(StratumError::AuthRejected(error.to_string())),
            Some(None) => {
                info!("Pool authorization successful");
                Ok(pre_auth_messages)
            }
        }
    }

    fn alloc_id(next_id: &mut u64) -> u64 {
        let id = *next_id;
        *next_id += 1;
        id
    }
}
