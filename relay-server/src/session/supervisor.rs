use chrono::Utc;
use common::{RelayError, Result, RetryPolicy, SessionSnapshot, SessionState};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::output::prepare_output_dir;
use super::transcoder::{TranscodeEvent, TranscodeJob, TranscodeProcess, Transcoder};
use crate::config::TranscoderConfig;
use crate::credential::CredentialResolver;
use crate::validation::LinkValidator;

/// 会话管理器依赖的外部组件
#[derive(Clone)]
pub struct SupervisorDeps {
    pub resolver: Arc<dyn CredentialResolver>,
    pub validator: Arc<dyn LinkValidator>,
    pub transcoder: Arc<dyn Transcoder>,
}

/// 会话管理器选项
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub transcoder: TranscoderConfig,
    pub clean_output_on_start: bool,
    pub retry: RetryPolicy,
}

/// 启动结果句柄
///
/// `wait` 在会话进入 Running 时返回 `Ok(())`，启动失败或被停止时返回对应错误。
#[derive(Debug)]
pub struct StartupHandle {
    pub session_id: Uuid,
    ready: oneshot::Receiver<Result<()>>,
}

impl StartupHandle {
    pub async fn wait(self) -> Result<()> {
        self.ready.await.unwrap_or(Err(RelayError::Cancelled))
    }
}

/// 单次尝试的结果
enum AttemptOutcome {
    Stopped,
    Failed(RelayError),
}

/// 受互斥锁保护的会话记录，所有状态变更都经过这里
struct Control {
    snapshot: SessionSnapshot,
    cancel: Option<CancellationToken>,
}

struct Inner {
    deps: SupervisorDeps,
    options: SupervisorOptions,
    control: Mutex<Control>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// 会话管理器
///
/// 同一时刻最多一个会话：Idle → Resolving → Validating → Starting → Running → Stopped|Failed。
/// 非终止状态下再次 `start` 会被拒绝而不是排队。
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl SessionSupervisor {
    pub fn new(deps: SupervisorDeps, options: SupervisorOptions) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::idle());
        Self {
            inner: Arc::new(Inner {
                deps,
                options,
                control: Mutex::new(Control {
                    snapshot: SessionSnapshot::idle(),
                    cancel: None,
                }),
                snapshot_tx,
            }),
        }
    }

    /// 开始新的中继会话
    pub fn start(&self, channel_name: &str) -> Result<StartupHandle> {
        let session_id = Uuid::new_v4();
        let token = CancellationToken::new();

        {
            let mut control = self.inner.lock();
            let state = control.snapshot.state;
            if !state.accepts_start() {
                warn!("Rejecting start for '{}': session is {}", channel_name, state);
                return Err(RelayError::Conflict { state });
            }

            control.snapshot = SessionSnapshot {
                session_id: Some(session_id),
                state: SessionState::Resolving,
                channel: Some(channel_name.to_string()),
                attempt: 1,
                started_at: Some(Utc::now()),
                ..SessionSnapshot::idle()
            };
            control.cancel = Some(token.clone());
            self.inner.publish(&control.snapshot);
        }

        info!(
            "🚀 Session {} starting for channel '{}'",
            session_id, channel_name
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let channel = channel_name.to_string();
        tokio::spawn(async move {
            inner.run_session(session_id, channel, token, ready_tx).await;
        });

        Ok(StartupHandle {
            session_id,
            ready: ready_rx,
        })
    }

    /// 停止当前会话
    ///
    /// 等到转码进程确认退出、状态进入终止态后才返回。
    pub async fn stop(&self) -> SessionSnapshot {
        let mut rx = self.inner.snapshot_tx.subscribe();

        let session_id = {
            let control = self.inner.lock();
            if control.snapshot.state.accepts_start() {
                return control.snapshot.clone();
            }
            if let Some(token) = &control.cancel {
                token.cancel();
            }
            control.snapshot.session_id
        };

        info!("Stopping session {:?}", session_id);
        let _ = rx
            .wait_for(|s| s.session_id != session_id || s.state.is_terminal())
            .await;

        self.snapshot()
    }

    pub fn current_state(&self) -> SessionState {
        self.inner.snapshot_tx.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, snapshot: &SessionSnapshot) {
        self.snapshot_tx.send_replace(snapshot.clone());
    }

    /// 修改指定会话的记录；过期会话的更新被忽略
    fn update<F>(&self, session_id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut SessionSnapshot),
    {
        let mut control = self.lock();
        if control.snapshot.session_id != Some(session_id) {
            debug!("Ignoring update from stale session {}", session_id);
            return false;
        }

        let old = control.snapshot.state;
        f(&mut control.snapshot);
        let new = control.snapshot.state;
        if old != new {
            info!("Session {}: {} → {}", session_id, old, new);
        }
        if new.is_terminal() {
            control.cancel = None;
        }
        self.publish(&control.snapshot);
        true
    }

    fn transition(&self, session_id: Uuid, state: SessionState) {
        self.update(session_id, |s| s.state = state);
    }

    /// 本次尝试是否曾进入 Running
    fn reached_running(&self, session_id: Uuid) -> bool {
        let control = self.lock();
        control.snapshot.session_id == Some(session_id) && control.snapshot.reached_running
    }

    /// 会话驱动：执行启动流程并监督转码进程，按策略重试
    async fn run_session(
        self: Arc<Self>,
        session_id: Uuid,
        channel: String,
        token: CancellationToken,
        ready_tx: oneshot::Sender<Result<()>>,
    ) {
        let mut ready_tx = Some(ready_tx);
        let mut retries = 0u32;

        loop {
            let outcome = self
                .run_attempt(session_id, &channel, &token, &mut ready_tx)
                .await;

            let err = match outcome {
                AttemptOutcome::Stopped => {
                    self.update(session_id, |s| {
                        s.state = SessionState::Stopped;
                        s.ended_at = Some(Utc::now());
                        s.pid = None;
                    });
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(RelayError::Cancelled));
                    }
                    return;
                }
                AttemptOutcome::Failed(err) => err,
            };

            // 运行过一段时间后的失败（如凭证轮换）重新获得完整的重试次数
            if self.reached_running(session_id) {
                retries = 0;
            }

            if token.is_cancelled() || !self.options.retry.should_retry(&err, retries) {
                error!("Session {} failed: {}", session_id, err);
                self.update(session_id, |s| {
                    s.state = SessionState::Failed;
                    s.ended_at = Some(Utc::now());
                    s.pid = None;
                    s.last_error = Some(err.to_string());
                });
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(err));
                }
                return;
            }

            let delay = self.options.retry.calculate_delay(retries);
            retries += 1;
            warn!(
                "Session {} attempt failed: {}. Retrying in {:?} ({}/{})",
                session_id, err, delay, retries, self.options.retry.max_retries
            );

            // 重试是一次全新的解析 → 校验 → 启动流程
            self.update(session_id, |s| {
                s.state = SessionState::Resolving;
                s.attempt += 1;
                s.reached_running = false;
                s.running_since = None;
                s.pid = None;
                s.last_error = Some(err.to_string());
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    self.update(session_id, |s| {
                        s.state = SessionState::Stopped;
                        s.ended_at = Some(Utc::now());
                    });
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(RelayError::Cancelled));
                    }
                    return;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        session_id: Uuid,
        channel: &str,
        token: &CancellationToken,
        ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> AttemptOutcome {
        // 解析凭证
        let resolved = tokio::select! {
            result = self.deps.resolver.resolve(channel) => result,
            _ = token.cancelled() => return AttemptOutcome::Stopped,
        };
        let descriptor = match resolved {
            Ok(descriptor) => descriptor,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        // 校验链接
        self.transition(session_id, SessionState::Validating);
        let validation = tokio::select! {
            result = self.deps.validator.validate(&descriptor.playback_url, &descriptor.headers) => result,
            _ = token.cancelled() => return AttemptOutcome::Stopped,
        };
        if !validation.valid {
            return AttemptOutcome::Failed(RelayError::ValidationFailed {
                status: validation.status,
                reason: validation.diagnostic_body,
            });
        }

        // 启动转码
        self.transition(session_id, SessionState::Starting);
        let config = &self.options.transcoder;
        if let Err(e) = prepare_output_dir(&config.output_dir, self.options.clean_output_on_start).await {
            return AttemptOutcome::Failed(e);
        }
        if token.is_cancelled() {
            return AttemptOutcome::Stopped;
        }

        let job = TranscodeJob::new(config, descriptor.playback_url, descriptor.headers);
        let process = match self.deps.transcoder.spawn(&job).await {
            Ok(process) => process,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        let pid = process.pid();
        self.update(session_id, |s| s.pid = pid);

        self.supervise(session_id, process, token, ready_tx).await
    }

    /// 处理转码进程生命周期事件，直到进程退出
    async fn supervise(
        &self,
        session_id: Uuid,
        mut process: TranscodeProcess,
        token: &CancellationToken,
        ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> AttemptOutcome {
        let grace = self.options.transcoder.stop_grace_period;
        let mut stop_requested = false;
        let mut terminating = false;
        let mut kill_deadline: Option<Instant> = None;
        let mut fatal: Option<String> = None;

        loop {
            // 停止请求优先于已排队的事件
            let event = tokio::select! {
                biased;

                _ = token.cancelled(), if !stop_requested => {
                    stop_requested = true;
                    if !terminating {
                        terminating = true;
                        kill_deadline = Some(Instant::now() + grace);
                        request_termination(&mut process);
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                    warn!(
                        "Transcoder (pid {:?}) did not exit within {:?}, forcing kill",
                        process.pid(),
                        grace
                    );
                    if let Err(e) = process.kill() {
                        error!("Failed to kill transcoder: {}", e);
                    }
                    kill_deadline = None;
                    continue;
                }
                event = process.events.recv() => event,
            };

            match event {
                Some(TranscodeEvent::Started { pid }) => {
                    let mut became_running = false;
                    self.update(session_id, |s| {
                        if s.state == SessionState::Starting && !stop_requested {
                            s.state = SessionState::Running;
                            s.reached_running = true;
                            s.running_since = Some(Utc::now());
                            became_running = true;
                        }
                        if pid.is_some() {
                            s.pid = pid;
                        }
                    });
                    if became_running {
                        info!("✅ Session {} is running (pid {:?})", session_id, pid);
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
                Some(TranscodeEvent::Progress(progress)) => {
                    debug!(
                        "Transcoder progress: out_time={:?}ms size={:?} speed={:?}",
                        progress.out_time_ms, progress.total_size, progress.speed
                    );
                }
                Some(TranscodeEvent::Error { message }) => {
                    error!("Error in transcoder process: {}", message);
                    fatal.get_or_insert(message);
                    if !terminating {
                        terminating = true;
                        kill_deadline = Some(Instant::now() + grace);
                        request_termination(&mut process);
                    }
                }
                Some(TranscodeEvent::Exited { code, success }) => {
                    if stop_requested || (success && fatal.is_none()) {
                        return AttemptOutcome::Stopped;
                    }
                    let reason = fatal
                        .or_else(|| process.diagnostics().last().cloned())
                        .unwrap_or_else(|| "no diagnostic output".to_string());
                    return AttemptOutcome::Failed(RelayError::ProcessRuntime(format!(
                        "exited with code {:?}: {}",
                        code, reason
                    )));
                }
                None => {
                    if stop_requested {
                        return AttemptOutcome::Stopped;
                    }
                    return AttemptOutcome::Failed(RelayError::ProcessRuntime(
                        "transcoder event channel closed unexpectedly".to_string(),
                    ));
                }
            }
        }
    }
}

/// 先发送 SIGTERM，失败时直接强制结束
fn request_termination(process: &mut TranscodeProcess) {
    info!("Terminating transcoder (pid {:?})", process.pid());
    if let Err(e) = process.terminate() {
        warn!("Graceful termination failed: {}. Killing instead", e);
        if let Err(e) = process.kill() {
            error!("Failed to kill transcoder: {}", e);
        }
    }
}
