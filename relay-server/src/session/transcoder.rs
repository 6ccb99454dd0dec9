use async_trait::async_trait;
use common::{RelayError, Result, REQUIRED_HEADERS};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::TranscoderConfig;

/// 保留的 stderr 行数
const DIAGNOSTIC_LINES: usize = 20;

/// 转码任务参数
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// 已校验的上游地址
    pub input_url: String,
    /// 原样转发的请求头
    pub headers: BTreeMap<String, String>,
    pub output_dir: PathBuf,
    pub manifest_name: String,
    pub segment_pattern: String,
    pub segment_duration_secs: u32,
    pub list_size: u32,
}

impl TranscodeJob {
    pub fn new(
        config: &TranscoderConfig,
        input_url: String,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            input_url,
            headers,
            output_dir: config.output_dir.clone(),
            manifest_name: config.manifest_name.clone(),
            segment_pattern: config.segment_pattern.clone(),
            segment_duration_secs: config.segment_duration_secs,
            list_size: config.list_size,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(&self.manifest_name)
    }

    /// ffmpeg `-headers` 参数内容，必需头部在前
    pub fn header_block(&self) -> String {
        let mut ordered: Vec<(&String, &String)> = Vec::with_capacity(self.headers.len());
        for required in REQUIRED_HEADERS {
            ordered.extend(
                self.headers
                    .iter()
                    .filter(|(name, _)| name.eq_ignore_ascii_case(required)),
            );
        }
        ordered.extend(self.headers.iter().filter(|(name, _)| {
            !REQUIRED_HEADERS
                .iter()
                .any(|required| name.eq_ignore_ascii_case(required))
        }));

        ordered
            .into_iter()
            .map(|(name, value)| format!("{}: {}\r\n", name, value))
            .collect()
    }
}

/// 转码进程进度
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeProgress {
    pub out_time_ms: Option<u64>,
    pub total_size: Option<u64>,
    pub speed: Option<String>,
}

/// 转码进程生命周期事件
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeEvent {
    /// 进程已启动
    Started { pid: Option<u32> },
    /// 进度更新
    Progress(TranscodeProgress),
    /// 进程报告致命错误
    Error { message: String },
    /// 进程已退出
    Exited { code: Option<i32>, success: bool },
}

/// 进程控制
pub trait ProcessControl: Send {
    fn pid(&self) -> Option<u32>;

    /// 请求进程优雅退出
    fn terminate(&mut self) -> Result<()>;

    /// 强制结束进程
    fn kill(&mut self) -> Result<()>;
}

/// 最近的 stderr 输出，附加到运行时错误中
#[derive(Debug, Clone, Default)]
pub struct DiagnosticTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl DiagnosticTail {
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == DIAGNOSTIC_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

/// 运行中的转码进程
pub struct TranscodeProcess {
    pub events: mpsc::Receiver<TranscodeEvent>,
    control: Box<dyn ProcessControl>,
    diagnostics: DiagnosticTail,
}

impl TranscodeProcess {
    pub fn new(
        events: mpsc::Receiver<TranscodeEvent>,
        control: Box<dyn ProcessControl>,
        diagnostics: DiagnosticTail,
    ) -> Self {
        Self {
            events,
            control,
            diagnostics,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn terminate(&mut self) -> Result<()> {
        self.control.terminate()
    }

    pub fn kill(&mut self) -> Result<()> {
        self.control.kill()
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.snapshot()
    }
}

/// 转码引擎
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(&self, job: &TranscodeJob) -> Result<TranscodeProcess>;
}

/// FFmpeg 命令行转码
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// 构建 ffmpeg 参数：copy 模式重新封装为 HLS 滚动窗口
    pub fn build_args(job: &TranscodeJob) -> Vec<String> {
        let segment_path = job.output_dir.join(&job.segment_pattern);
        let manifest_path = job.manifest_path();

        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "level+warning",
            "-nostats",
            "-progress",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // 输入配置
        args.push("-headers".to_string());
        args.push(job.header_block());
        args.push("-i".to_string());
        args.push(job.input_url.clone());

        // 输出配置
        args.extend([
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            job.segment_duration_secs.to_string(),
            "-hls_list_size".to_string(),
            job.list_size.to_string(),
            "-hls_flags".to_string(),
            "append_list+delete_segments+program_date_time+temp_file".to_string(),
            "-hls_segment_filename".to_string(),
            segment_path.to_string_lossy().into_owned(),
            "-y".to_string(),
            manifest_path.to_string_lossy().into_owned(),
        ]);

        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> Result<TranscodeProcess> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(Self::build_args(job));

        info!(
            "Starting FFmpeg: {} -> {}",
            job.input_url,
            job.manifest_path().display()
        );
        spawn_monitored(cmd)
    }
}

/// 启动子进程并监控其输出与退出
///
/// stdout 按 ffmpeg `-progress` 格式解析为进度事件，stderr 进入诊断缓冲区，
/// `[fatal]` 行转为错误事件。
pub fn spawn_monitored(mut cmd: Command) -> Result<TranscodeProcess> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| RelayError::ProcessStart(format!("{:?}: {}", cmd.as_std().get_program(), e)))?;

    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RelayError::ProcessStart("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RelayError::ProcessStart("Failed to capture stderr".to_string()))?;

    let (tx, rx) = mpsc::channel(64);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let diagnostics = DiagnosticTail::default();

    // 通道为空，不会失败
    let _ = tx.try_send(TranscodeEvent::Started { pid });
    info!("FFmpeg process started (pid {:?})", pid);

    // 进度
    let progress_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::default();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(progress) = parser.feed(&line) {
                // 消费方跟不上时丢弃进度，不阻塞 ffmpeg
                let _ = progress_tx.try_send(TranscodeEvent::Progress(progress));
            }
        }
    });

    // 错误日志监控
    let stderr_tx = tx.clone();
    let tail = diagnostics.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("[fatal]") {
                warn!("FFmpeg: {}", line);
                let _ = stderr_tx
                    .send(TranscodeEvent::Error {
                        message: line.clone(),
                    })
                    .await;
            } else if line.starts_with("[error]") {
                warn!("FFmpeg: {}", line);
            } else {
                debug!("FFmpeg: {}", line);
            }
            tail.push(line);
        }
    });

    // 等待进程结束
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill FFmpeg process: {}", e);
                }
                child.wait().await
            }
        };

        // 尽量读完 stderr 再报告退出
        let _ = tokio::time::timeout(Duration::from_secs(1), stderr_task).await;

        let event = match status {
            Ok(status) => {
                if status.success() {
                    info!("FFmpeg process finished");
                } else {
                    warn!("FFmpeg process exited with status: {}", status);
                }
                TranscodeEvent::Exited {
                    code: status.code(),
                    success: status.success(),
                }
            }
            Err(e) => {
                let _ = tx
                    .send(TranscodeEvent::Error {
                        message: format!("Failed to wait for FFmpeg process: {}", e),
                    })
                    .await;
                TranscodeEvent::Exited {
                    code: None,
                    success: false,
                }
            }
        };
        let _ = tx.send(event).await;
    });

    Ok(TranscodeProcess::new(
        rx,
        Box::new(ChildControl {
            pid,
            kill_tx: Some(kill_tx),
        }),
        diagnostics,
    ))
}

/// 通过信号控制子进程
struct ChildControl {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => Ok(()),
            // 进程已经退出
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(RelayError::ProcessRuntime(format!(
                "Failed to send SIGTERM to {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok(())
    }
}

/// 解析 ffmpeg `-progress` 输出（key=value 行，以 progress= 结束一个块）
#[derive(Debug, Default)]
struct ProgressParser {
    current: TranscodeProgress,
}

impl ProgressParser {
    fn feed(&mut self, line: &str) -> Option<TranscodeProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key {
            // ffmpeg 的 out_time_ms 实际单位为微秒
            "out_time_us" | "out_time_ms" => {
                self.current.out_time_ms = value.parse::<u64>().ok().map(|us| us / 1000);
            }
            "total_size" => self.current.total_size = value.parse().ok(),
            "speed" => {
                self.current.speed = (value != "N/A").then(|| value.to_string());
            }
            "progress" => return Some(std::mem::take(&mut self.current)),
            _ => {}
        }
        None
    }
}
