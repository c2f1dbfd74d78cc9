use crate::{
    sharelog::{ShareEvent, ShareLog, ShareLogError},
    state::{MinerState, StateMachine},
    stats::MinerStats,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use taohash_stratum::{
    methods, parse_line, protocol::ERR_INVALID_STATE, user_agent, PoolDescriptor, StratumMessage,
    StratumRequest, StratumResponse, UpstreamSession,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

type Wire = Framed<TcpStream, LinesCodec>;

/// Window for draining the burst of messages miners send right on connect.
const EARLY_BURST_WINDOW: Duration = Duration::from_secs(1);

/// Per-read timeout inside the early burst; the first idle gap ends it.
const EARLY_BURST_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Difficulty assumed when the pool pushed none before the miner authorized.
const FALLBACK_INITIAL_DIFFICULTY: f64 = 1024.0;

/// Session-fatal errors. Faults are localized to one connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("upstream error: {0}")]
    Upstream(#[from] taohash_stratum::StratumError),

    #[error("share log error: {0}")]
    ShareLog(#[from] ShareLogError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("framing error: {0}")]
    Frame(#[from] LinesCodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Metadata captured when a submit is forwarded upstream, held until the
/// pool's verdict arrives for that request id.
#[derive(Debug, Clone)]
struct SubmitMeta {
    job_id: String,
    difficulty: f64,
}

/// Extract a `;md=<integer>;` minimum-difficulty directive from an authorize
/// password (case-insensitive, trailing `;` optional at end of string).
///
/// Returns the password with the directive stripped and the parsed value.
/// Parsing never fails the session: an unparseable number is logged and
/// treated as if no directive were present.
pub fn parse_min_difficulty(password: &str) -> (String, Option<u64>) {
    let lower = password.to_ascii_lowercase();
    let mut search = 0;

    while let Some(found) = lower[search..].find(";md=") {
        let start = search + found;
        let value_start = start + ";md=".len();
        let rest = &password[value_start..];
        let (digits, end) = match rest.find(';') {
            Some(semi) => (&rest[..semi], value_start + semi + 1),
            None => (rest, password.len()),
        };

        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            let mut clean = String::with_capacity(password.len());
            clean.push_str(&password[..start]);
            clean.push_str(&password[end..]);
            return match digits.parse::<u64>() {
                Ok(value) => (clean, Some(value)),
                Err(e) => {
                    warn!("Invalid min difficulty value '{}' in password: {}", digits, e);
                    (clean, None)
                }
            };
        }
        search = start + 1;
    }

    (password.to_string(), None)
}

/// Effective difficulty signalled to the miner: the pool's value clamped
/// from below by the password minimum, when one was declared.
fn clamp_difficulty(pool_diff: f64, min_difficulty: Option<u64>) -> f64 {
    match min_difficulty {
        Some(min) => pool_diff.max(min as f64),
        None => pool_diff,
    }
}

/// Synthesize a configure result for legacy upstreams that never answered
/// `mining.configure`: echo a requested version-rolling mask so
/// version-rolling miners keep working against them.
fn local_configure_result(request: &StratumRequest) -> Value {
    let extensions = request.params.first().and_then(Value::as_array);
    let extension_params = request.params.get(1).and_then(Value::as_object);

    let wants_version_rolling = extensions
        .map(|exts| exts.iter().any(|e| e.as_str() == Some("version-rolling")))
        .unwrap_or(false);
    let mask = extension_params
        .and_then(|p| p.get("version-rolling.mask"))
        .and_then(Value::as_str);

    match (wants_version_rolling, mask) {
        (true, Some(mask)) => json!({"version-rolling": true, "version-rolling.mask": mask}),
        _ => json!({}),
    }
}

enum Peer {
    Miner(Option<Result<String, LinesCodecError>>),
    Pool(Option<Result<String, LinesCodecError>>),
}

/// One miner connection and its traffic brokered to/from the bound pool.
///
/// Owns the upstream session, the per-connection state machine, the
/// pending-submit correlation map, and the miner's stats entry. Everything
/// runs on a single task: reads from either socket, writes, and share-log
/// appends are all awaited inline, which keeps in-session ordering without
/// locks.
pub struct MinerSession {
    miner_id: String,
    pool: PoolDescriptor,
    pool_label: String,
    stats: Arc<Mutex<MinerStats>>,
    sharelog: Arc<ShareLog>,
    state: StateMachine,
    min_difficulty: Option<u64>,
    pending_requests: HashMap<Value, SubmitMeta>,
    pending_configure: Option<StratumRequest>,
    configure_probed: bool,
    initial_difficulty: Option<f64>,
    initial_job: Option<StratumRequest>,
    upstream: Option<UpstreamSession>,
}

impl MinerSession {
    pub fn new(
        peer: SocketAddr,
        pool: PoolDescriptor,
        pool_label: String,
        stats: Arc<Mutex<MinerStats>>,
        sharelog: Arc<ShareLog>,
    ) -> Self {
        let miner_id = peer.to_string();
        info!("[{}] Miner session initialized", miner_id);
        Self {
            state: StateMachine::new(&miner_id),
            miner_id,
            pool,
            pool_label,
            stats,
            sharelog,
            min_difficulty: None,
            pending_requests: HashMap::new(),
            pending_configure: None,
            configure_probed: false,
            initial_difficulty: None,
            initial_job: None,
            upstream: None,
        }
    }

    /// Manage the whole connection lifecycle: early burst, pool handshake,
    /// bidirectional brokering, cleanup.
    pub async fn run(mut self, stream: TcpStream) {
        let mut miner = Framed::new(stream, LinesCodec::new());

        let mut pool = match self.establish(&mut miner).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("[{}] Session setup failed: {}", self.miner_id, e);
                self.state.transition_to(MinerState::Error);
                self.cleanup(&mut miner, None).await;
                return;
            }
        };

        if let Err(e) = self.broker(&mut miner, &mut pool).await {
            warn!("[{}] Session error: {}", self.miner_id, e);
            self.state.transition_to(MinerState::Error);
        }

        self.cleanup(&mut miner, Some(&mut pool)).await;
    }

    /// Collect the early burst, connect upstream, replay the cached
    /// configure answer, and feed the queued early messages through normal
    /// processing. Returns the pool-side stream for the broker loop.
    async fn establish(&mut self, miner: &mut Wire) -> Result<Wire, SessionError> {
        let early = self.collect_early_burst(miner).await?;

        self.configure_probed = self.pending_configure.is_some();
        let mut upstream = UpstreamSession::connect(
            &self.pool,
            self.pending_configure.as_ref(),
            user_agent(),
        )
        .await?;
        self.capture_initial_work(&mut upstream);

        let mut pool = upstream
            .take_stream()
            .ok_or(SessionError::Internal("upstream stream already taken"))?;
        self.upstream = Some(upstream);
        info!("[{}] Pool connection established", self.miner_id);

        self.replay_pending_configure(miner).await?;

        for message in early {
            self.process_miner_message(message, miner, &mut pool).await?;
            self.drain_queues_if_active(miner, &mut pool).await?;
        }

        Ok(pool)
    }

    /// Read whatever the miner sends immediately on accept, before the
    /// upstream exists. A `mining.configure` is held for the handshake, a
    /// difficulty suggestion is answered locally, everything else is kept
    /// for replay once the pool connection is ready.
    async fn collect_early_burst(
        &mut self,
        miner: &mut Wire,
    ) -> Result<Vec<StratumMessage>, SessionError> {
        let deadline = Instant::now() + EARLY_BURST_WINDOW;
        let mut queued = Vec::new();

        while Instant::now() < deadline {
            let line = match timeout(EARLY_BURST_READ_TIMEOUT, miner.next()).await {
                Ok(Some(line)) => line?,
                Ok(None) => break,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = match parse_line(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!("[{}] Invalid JSON in initial request: {}", self.miner_id, e);
                    continue;
                }
            };

            match message {
                StratumMessage::Request(request) if request.method == methods::CONFIGURE => {
                    debug!(
                        "[{}] Stored configure request until pool connection ready",
                        self.miner_id
                    );
                    self.pending_configure = Some(request);
                }
                StratumMessage::Request(request)
                    if request.method == methods::SUGGEST_DIFFICULTY
                        || request.method == methods::SUGGEST_TARGET =>
                {
                    // No minimum can be in force before authorize; a plain
                    // acknowledgement is all the miner needs this early.
                    self.respond_ok(miner, request.id.clone(), Value::Bool(true))
                        .await?;
                }
                other => queued.push(other),
            }
        }

        info!(
            "[{}] Collected {} early messages",
            self.miner_id,
            queued.len()
        );
        Ok(queued)
    }

    /// Pull the initial difficulty and first job out of the pool's buffered
    /// pre-auth messages, for replay after the miner authorizes.
    fn capture_initial_work(&mut self, upstream: &mut UpstreamSession) {
        for message in upstream.pre_auth_messages.drain(..) {
            let StratumMessage::Request(request) = message else {
                continue;
            };
            if request.method == methods::SET_DIFFICULTY {
                if let Some(diff) = request.params.first().and_then(Value::as_f64) {
                    if self.initial_difficulty.is_none() {
                        debug!(
                            "[{}] Got initial difficulty {} from pool",
                            self.miner_id, diff
                        );
                        self.initial_difficulty = Some(diff);
                        self.stats.lock().pool_difficulty = diff;
                    }
                }
            } else if request.method == methods::NOTIFY && self.initial_job.is_none() {
                debug!("[{}] Got initial job from pool", self.miner_id);
                self.initial_job = Some(request);
            }
        }
    }

    /// Answer the configure collected in the early burst, from the pool's
    /// cached result or a local echo when the pool never replied.
    async fn replay_pending_configure(&mut self, miner: &mut Wire) -> Result<(), SessionError> {
        let Some(request) = self.pending_configure.take() else {
            return Ok(());
        };

        let cached = self
            .upstream
            .as_ref()
            .and_then(|up| up.configure_response.clone());
        let result = match cached {
            Some(result) => result,
            None => {
                info!(
                    "[{}] Legacy upstream detected, answering configure locally",
                    self.miner_id
                );
                local_configure_result(&request)
            }
        };
        self.respond_ok(miner, request.id.clone(), result).await
    }

    /// Bidirectional proxy loop. Ends on EOF or a fatal error from either
    /// side; when one direction ends the other is torn down with it.
    async fn broker(&mut self, miner: &mut Wire, pool: &mut Wire) -> Result<(), SessionError> {
        loop {
            let event = tokio::select! {
                line = miner.next() => Peer::Miner(line),
                line = pool.next() => Peer::Pool(line),
            };

            match event {
                Peer::Miner(Some(Ok(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_line(&line) {
                        Ok(message) => {
                            self.process_miner_message(message, miner, pool).await?;
                            self.drain_queues_if_active(miner, pool).await?;
                        }
                        Err(e) => warn!("[{}] Invalid JSON from miner: {}", self.miner_id, e),
                    }
                }
                Peer::Pool(Some(Ok(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_line(&line) {
                        Ok(message) => {
                            self.process_pool_message(message, miner).await?;
                            self.drain_queues_if_active(miner, pool).await?;
                        }
                        Err(e) => warn!("[{}] Invalid JSON from pool: {}", self.miner_id, e),
                    }
                }
                Peer::Miner(Some(Err(e))) | Peer::Pool(Some(Err(e))) => return Err(e.into()),
                Peer::Miner(None) => {
                    debug!("[{}] Miner closed connection", self.miner_id);
                    return Ok(());
                }
                Peer::Pool(None) => {
                    debug!("[{}] Pool closed connection", self.miner_id);
                    self.state.transition_to(MinerState::Error);
                    return Ok(());
                }
            }
        }
    }

    /// Route one miner message: state validation, local handling, or
    /// forwarding upstream.
    async fn process_miner_message(
        &mut self,
        message: StratumMessage,
        miner: &mut Wire,
        pool: &mut Wire,
    ) -> Result<(), SessionError> {
        let request = match message {
            StratumMessage::Response(response) => {
                // Miner answering a pool-originated request; pass through.
                return self
                    .send_to_pool(pool, &StratumMessage::Response(response))
                    .await;
            }
            StratumMessage::Request(request) => request,
        };

        debug!("[{}] From miner: {}", self.miner_id, request);

        // ASIC-boost negotiation and extranonce subscription bypass the
        // state gate; miners send them at arbitrary points in the handshake.
        if request.method == methods::CONFIGURE {
            return self.handle_configure(request, miner, pool).await;
        }
        if request.method == methods::EXTRANONCE_SUBSCRIBE {
            return self.handle_extranonce_subscribe(request, miner).await;
        }

        if !self.state.can_handle(&request.method) {
            if self.state.state().queues_messages() {
                debug!(
                    "[{}] Queued {} in state {:?}",
                    self.miner_id,
                    request.method,
                    self.state.state()
                );
                self.state.queue_miner_message(StratumMessage::Request(request));
            } else if request.id.is_some() {
                warn!(
                    "[{}] Rejected {} in state {:?}",
                    self.miner_id,
                    request.method,
                    self.state.state()
                );
                self.respond_error(miner, request.id.clone(), "Invalid message for current state")
                    .await?;
            }
            return Ok(());
        }

        if request.method == methods::SUBSCRIBE {
            self.handle_subscribe(request, miner).await
        } else if request.method == methods::AUTHORIZE {
            self.handle_authorize(request, miner).await
        } else if request.method == methods::SUBMIT {
            self.handle_submit(request, pool).await
        } else if request.method == methods::SUGGEST_DIFFICULTY
            || request.method == methods::SUGGEST_TARGET
        {
            self.handle_suggest_difficulty(request, miner, pool).await
        } else {
            debug!(
                "[{}] Forwarding unknown method {} to pool",
                self.miner_id, request.method
            );
            self.send_to_pool(pool, &StratumMessage::Request(request))
                .await
        }
    }

    /// Route one pool message: submit verdicts, job/difficulty/extranonce
    /// notifications, passthrough for the rest.
    async fn process_pool_message(
        &mut self,
        message: StratumMessage,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        match message {
            StratumMessage::Response(response) => {
                let meta = response
                    .id
                    .as_ref()
                    .and_then(|id| self.pending_requests.remove(id));
                match meta {
                    Some(meta) => self.handle_submit_response(response, meta, miner).await,
                    None => {
                        self.forward_or_queue_to_miner(StratumMessage::Response(response), miner)
                            .await
                    }
                }
            }
            StratumMessage::Request(request) => {
                debug!("[{}] From pool: {}", self.miner_id, request);
                if request.method == methods::NOTIFY {
                    self.handle_job_notify(request, miner).await
                } else if request.method == methods::SET_DIFFICULTY {
                    self.handle_set_difficulty(request, miner).await
                } else if request.method == methods::SET_EXTRANONCE {
                    self.handle_set_extranonce(request, miner).await
                } else {
                    self.forward_or_queue_to_miner(StratumMessage::Request(request), miner)
                        .await
                }
            }
        }
    }

    /// `mining.subscribe`: answer with the pool's subscription data. The
    /// pool already subscribed the single proxy-side connection, so nothing
    /// is forwarded.
    async fn handle_subscribe(
        &mut self,
        request: StratumRequest,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        debug!("[{}] Processing mining.subscribe", self.miner_id);

        if !self.state.transition_to(MinerState::Subscribing) {
            return self
                .respond_error(miner, request.id.clone(), "Invalid state for subscribe")
                .await;
        }

        let (subscription_ids, extranonce1, extranonce2_size) = match self.upstream.as_ref() {
            Some(up) => (
                up.subscription_ids.clone(),
                up.extranonce1.clone(),
                up.extranonce2_size,
            ),
            None => return Err(SessionError::Internal("subscribe before upstream connected")),
        };

        self.respond_ok(
            miner,
            request.id.clone(),
            json!([subscription_ids, extranonce1, extranonce2_size]),
        )
        .await?;
        self.state.transition_to(MinerState::Subscribed);
        Ok(())
    }

    /// `mining.authorize`: record the worker name and any password-embedded
    /// minimum difficulty, answer success unconditionally (the proxy mines
    /// under the pool account), then replay the initial work.
    async fn handle_authorize(
        &mut self,
        request: StratumRequest,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        let username = request
            .params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let password = request
            .params
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        debug!(
            "[{}] Processing mining.authorize for {}",
            self.miner_id, username
        );

        if !self.state.transition_to(MinerState::Authorizing) {
            return self
                .respond_error(miner, request.id.clone(), "Invalid state for authorize")
                .await;
        }

        let (_, min_difficulty) = parse_min_difficulty(&password);
        if let Some(min) = min_difficulty {
            info!(
                "[{}] Set min_difficulty={} from password",
                self.miner_id, min
            );
            self.min_difficulty = Some(min);
        }

        {
            let mut stats = self.stats.lock();
            stats.worker_name = Some(username.clone());
            stats.pool_type = Some(self.pool_label.clone());
        }
        info!(
            "[{}] Miner authorized with username: {}",
            self.miner_id, username
        );

        self.respond_ok(miner, request.id.clone(), Value::Bool(true))
            .await?;
        self.state.transition_to(MinerState::Authorized);
        self.send_initial_work(miner).await
    }

    /// Push the initial difficulty (clamped by any password minimum) and the
    /// cached first job right after a successful authorize.
    async fn send_initial_work(&mut self, miner: &mut Wire) -> Result<(), SessionError> {
        let pool_diff = self
            .initial_difficulty
            .unwrap_or(FALLBACK_INITIAL_DIFFICULTY);
        let effective = clamp_difficulty(pool_diff, self.min_difficulty);
        info!(
            "[{}] Initial difficulty: pool={}, effective={}",
            self.miner_id, pool_diff, effective
        );

        self.stats.lock().update_difficulty(effective);
        self.send_to_miner(
            miner,
            &StratumMessage::Request(StratumRequest::set_difficulty(effective)),
        )
        .await?;

        if let Some(job) = self.initial_job.take() {
            self.send_to_miner(miner, &StratumMessage::Request(job))
                .await?;
            self.state.transition_to(MinerState::Active);
        } else {
            debug!("[{}] Waiting for initial job from pool", self.miner_id);
        }
        Ok(())
    }

    /// `mining.submit`: record correlation metadata, rewrite the worker to
    /// the pool account name, forward upstream.
    async fn handle_submit(
        &mut self,
        mut request: StratumRequest,
        pool: &mut Wire,
    ) -> Result<(), SessionError> {
        let Some(id) = request.id.clone() else {
            warn!(
                "[{}] Submit without request id; forwarding untracked",
                self.miner_id
            );
            if let Some(worker) = request.params.get_mut(0) {
                *worker = Value::String(self.pool.user.clone());
            }
            return self
                .send_to_pool(pool, &StratumMessage::Request(request))
                .await;
        };

        let job_id = request
            .params
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let difficulty = {
            let stats = self.stats.lock();
            match stats.short_worker_name() {
                Some(worker) => info!(
                    "[{}] {} - Share submission for job {}",
                    self.miner_id, worker, job_id
                ),
                None => info!("[{}] Share submission for job {}", self.miner_id, job_id),
            }
            stats.difficulty
        };

        // Insert before forwarding so the verdict can never race the
        // metadata.
        self.pending_requests.insert(id, SubmitMeta { job_id, difficulty });

        if let Some(worker) = request.params.get_mut(0) {
            *worker = Value::String(self.pool.user.clone());
        }
        self.send_to_pool(pool, &StratumMessage::Request(request))
            .await
    }

    /// `mining.suggest_difficulty` / `mining.suggest_target`: acknowledge
    /// locally; when a minimum is in force, signal it downward and rewrite
    /// the suggestion before forwarding upstream.
    async fn handle_suggest_difficulty(
        &mut self,
        mut request: StratumRequest,
        miner: &mut Wire,
        pool: &mut Wire,
    ) -> Result<(), SessionError> {
        self.respond_ok(miner, request.id.clone(), Value::Bool(true))
            .await?;

        let suggested = request.params.first().and_then(Value::as_f64);
        match (suggested, self.min_difficulty) {
            (Some(suggested), Some(min)) if suggested > 0.0 => {
                let effective = min as f64;
                self.stats.lock().update_difficulty(effective);
                self.send_to_miner(
                    miner,
                    &StratumMessage::Request(StratumRequest::set_difficulty(effective)),
                )
                .await?;

                request.params[0] = json!(effective);
                debug!(
                    "[{}] Miner suggested {}, enforced min={}, forwarded to pool",
                    self.miner_id, suggested, min
                );
                self.send_to_pool(pool, &StratumMessage::Request(request))
                    .await
            }
            _ => {
                self.send_to_pool(pool, &StratumMessage::Request(request))
                    .await
            }
        }
    }

    /// `mining.configure` after the handshake: answer from the cached pool
    /// result, locally for legacy upstreams, or forward for the pool to
    /// decide.
    async fn handle_configure(
        &mut self,
        request: StratumRequest,
        miner: &mut Wire,
        pool: &mut Wire,
    ) -> Result<(), SessionError> {
        match self.upstream.as_ref().map(|up| up.configure_response.clone()) {
            Some(Some(result)) => {
                debug!("[{}] Returned cached configure response", self.miner_id);
                self.respond_ok(miner, request.id.clone(), result).await
            }
            Some(None) if self.configure_probed => {
                debug!(
                    "[{}] Answering configure locally for legacy upstream",
                    self.miner_id
                );
                let result = local_configure_result(&request);
                self.respond_ok(miner, request.id.clone(), result).await
            }
            Some(None) => {
                debug!("[{}] Forwarding late mining.configure to pool", self.miner_id);
                self.send_to_pool(pool, &StratumMessage::Request(request))
                    .await
            }
            None => {
                debug!(
                    "[{}] Stored configure request until pool connection ready",
                    self.miner_id
                );
                self.pending_configure = Some(request);
                Ok(())
            }
        }
    }

    /// `mining.extranonce.subscribe`: acknowledged locally, never forwarded;
    /// the proxy-side connection is already subscribed.
    async fn handle_extranonce_subscribe(
        &mut self,
        request: StratumRequest,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        debug!(
            "[{}] Acknowledging extranonce subscription id={:?}",
            self.miner_id, request.id
        );
        self.respond_ok(miner, request.id.clone(), Value::Bool(true))
            .await
    }

    /// Pool verdict for a tracked submit: append to the share log, update
    /// stats, then release the response. The append must succeed before the
    /// miner sees the response.
    async fn handle_submit_response(
        &mut self,
        response: StratumResponse,
        meta: SubmitMeta,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        let accepted = response.is_accepted();
        let error = response.error.as_ref().map(|e| e.to_string());

        let event = ShareEvent {
            ts: Utc::now().timestamp(),
            miner: self.share_identity(),
            pool: self.pool_label.clone(),
            difficulty: meta.difficulty,
            accepted,
            error: error.clone(),
        };
        self.sharelog.append(&event).await?;
        self.stats
            .lock()
            .record_share(accepted, meta.difficulty, &self.pool_label);

        let worker_prefix = {
            let stats = self.stats.lock();
            stats
                .short_worker_name()
                .map(|w| format!("{w} - "))
                .unwrap_or_default()
        };
        if accepted {
            info!(
                "[{}] {}Share accepted for job {}",
                self.miner_id, worker_prefix, meta.job_id
            );
        } else {
            let reason = response
                .error
                .as_ref()
                .and_then(|e| e.get(1))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(error)
                .unwrap_or_else(|| "unknown".to_string());
            info!(
                "[{}] {}Share rejected ({})",
                self.miner_id, worker_prefix, reason
            );
        }

        self.send_to_miner(miner, &StratumMessage::Response(response))
            .await
    }

    /// `mining.notify` from the pool: activates an authorized session and is
    /// forwarded; pre-authorize it refreshes the cached initial job.
    async fn handle_job_notify(
        &mut self,
        request: StratumRequest,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        if self.state.state() == MinerState::Authorized {
            self.state.transition_to(MinerState::Active);
        }

        if self.state.state() == MinerState::Active {
            self.send_to_miner(miner, &StratumMessage::Request(request))
                .await
        } else {
            self.initial_job = Some(request);
            Ok(())
        }
    }

    /// `mining.set_difficulty` from the pool: clamp with the password
    /// minimum, rewrite when the effective value differs, forward.
    async fn handle_set_difficulty(
        &mut self,
        mut request: StratumRequest,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        let Some(pool_diff) = request.params.first().and_then(Value::as_f64) else {
            return Ok(());
        };

        self.stats.lock().pool_difficulty = pool_diff;

        if self.state.state() != MinerState::Active {
            // Not mining yet: becomes the difficulty replayed at authorize.
            self.initial_difficulty = Some(pool_diff);
            return Ok(());
        }

        let effective = clamp_difficulty(pool_diff, self.min_difficulty);
        if effective != pool_diff {
            info!(
                "[{}] Difficulty: pool={}, effective={}",
                self.miner_id, pool_diff, effective
            );
            request.params[0] = json!(effective);
        }
        self.stats.lock().update_difficulty(effective);
        self.send_to_miner(miner, &StratumMessage::Request(request))
            .await
    }

    /// `mining.set_extranonce` from the pool: refresh the cached extranonce
    /// parameters and forward unchanged.
    async fn handle_set_extranonce(
        &mut self,
        request: StratumRequest,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        if let (Some(extranonce1), Some(extranonce2_size)) = (
            request.params.first().and_then(Value::as_str),
            request.params.get(1).and_then(Value::as_u64),
        ) {
            info!(
                "[{}] Pool changed extranonce: {} (size {})",
                self.miner_id, extranonce1, extranonce2_size
            );
            if let Some(upstream) = self.upstream.as_mut() {
                upstream.extranonce1 = extranonce1.to_string();
                upstream.extranonce2_size = extranonce2_size;
            }
        }
        self.forward_or_queue_to_miner(StratumMessage::Request(request), miner)
            .await
    }

    async fn forward_or_queue_to_miner(
        &mut self,
        message: StratumMessage,
        miner: &mut Wire,
    ) -> Result<(), SessionError> {
        if self.state.state() == MinerState::Active {
            self.send_to_miner(miner, &message).await
        } else {
            self.state.queue_pool_message(message);
            Ok(())
        }
    }

    /// Flush messages parked during the handshake once the session reaches
    /// ACTIVE: pool notifications first, then the miner's queued requests
    /// through normal processing.
    async fn drain_queues_if_active(
        &mut self,
        miner: &mut Wire,
        pool: &mut Wire,
    ) -> Result<(), SessionError> {
        if self.state.state() != MinerState::Active || !self.state.has_queued() {
            return Ok(());
        }

        for message in self.state.take_queued_pool_messages() {
            self.send_to_miner(miner, &message).await?;
        }
        for message in self.state.take_queued_miner_messages() {
            self.process_miner_message(message, miner, pool).await?;
        }
        Ok(())
    }

    /// Identity recorded in the share log: `worker@ip:port`, or just the
    /// peer when the miner never declared a worker name.
    fn share_identity(&self) -> String {
        let stats = self.stats.lock();
        match stats.worker_name.as_deref() {
            Some(worker) => format!("{}@{}", worker, self.miner_id),
            None => self.miner_id.clone(),
        }
    }

    async fn send_to_miner(
        &self,
        miner: &mut Wire,
        message: &StratumMessage,
    ) -> Result<(), SessionError> {
        let line = message.to_line()?;
        debug!("[{}] To miner: {}", self.miner_id, line);
        miner.send(line).await?;
        Ok(())
    }

    async fn send_to_pool(
        &self,
        pool: &mut Wire,
        message: &StratumMessage,
    ) -> Result<(), SessionError> {
        let line = message.to_line()?;
        debug!("[{}] To pool: {}", self.miner_id, line);
        pool.send(line).await?;
        Ok(())
    }

    async fn respond_ok(
        &self,
        miner: &mut Wire,
        id: Option<Value>,
        result: Value,
    ) -> Result<(), SessionError> {
        self.send_to_miner(
            miner,
            &StratumMessage::Response(StratumResponse::ok(id, result)),
        )
        .await
    }

    async fn respond_error(
        &self,
        miner: &mut Wire,
        id: Option<Value>,
        message: &str,
    ) -> Result<(), SessionError> {
        self.send_to_miner(
            miner,
            &StratumMessage::Response(StratumResponse::error(id, ERR_INVALID_STATE, message)),
        )
        .await
    }

    async fn cleanup(&mut self, miner: &mut Wire, pool: Option<&mut Wire>) {
        info!("[{}] Cleaning up session", self.miner_id);
        self.state.transition_to(MinerState::Disconnecting);

        let _ = SinkExt::<String>::close(miner).await;
        if let Some(pool) = pool {
            let _ = SinkExt::<String>::close(pool).await;
        }

        // Stale correlation entries die with the session.
        self.pending_requests.clear();
        self.state.transition_to(MinerState::Disconnected);
        info!(
            "[{}] Final state: {:?}",
            self.miner_id,
            self.state.state()
        );
    }
}
