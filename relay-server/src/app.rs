use common::{RelayError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::credential::{build_http_client, HttpCredentialResolver};
use crate::http::RelayServer;
use crate::publisher::OutputPublisher;
use crate::session::{
    prepare_output_dir, FfmpegTranscoder, SessionSupervisor, SupervisorDeps, SupervisorOptions,
};
use crate::validation::HttpLinkValidator;

/// 中继应用：组装会话管理器、输出发布器与 HTTP 服务
pub struct RelayApp {
    config: AppConfig,
    supervisor: SessionSupervisor,
    publisher: OutputPublisher,
}

impl RelayApp {
    /// 使用真实的上游与 ffmpeg 组件
    pub fn from_config(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let client = build_http_client(&config.upstream)?;
        let deps = SupervisorDeps {
            resolver: Arc::new(HttpCredentialResolver::new(
                client.clone(),
                config.upstream.descriptor_url.clone(),
            )),
            validator: Arc::new(HttpLinkValidator::new(client)),
            transcoder: Arc::new(FfmpegTranscoder::new(config.transcoder.ffmpeg_path.clone())),
        };

        Ok(Self::with_deps(config, deps))
    }

    /// 使用自定义组件（测试中注入替身）
    pub fn with_deps(config: AppConfig, deps: SupervisorDeps) -> Self {
        let options = SupervisorOptions {
            transcoder: config.transcoder.clone(),
            clean_output_on_start: config.session.clean_output_on_start,
            retry: config.recovery.retry_policy(),
        };
        let supervisor = SessionSupervisor::new(deps, options);
        let publisher = OutputPublisher::new(supervisor.subscribe(), &config);

        Self {
            config,
            supervisor,
            publisher,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub fn publisher(&self) -> &OutputPublisher {
        &self.publisher
    }

    /// 运行服务
    ///
    /// `shutdown` 完成后先停止会话（等待转码进程退出），再关闭 HTTP 服务。
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // 静态文件目录需在服务启动前存在
        prepare_output_dir(&self.config.transcoder.output_dir, false).await?;

        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid listen address: {}", e)))?;

        let closing = CancellationToken::new();
        let server = RelayServer::new(
            addr,
            self.supervisor.clone(),
            self.publisher.clone(),
            self.config.upstream.channel_name.clone(),
            self.config.server.hls_prefix.clone(),
            closing.clone(),
        );

        if self.config.session.auto_start {
            let channel = self.config.upstream.channel_name.clone();
            match self.supervisor.start(&channel) {
                Ok(handle) => {
                    let publisher = self.publisher.clone();
                    tokio::spawn(async move {
                        match handle.wait().await {
                            Ok(()) => info!("✓ Stream available at {}", publisher.manifest_url()),
                            Err(e) => warn!("Relay for '{}' did not start: {}", channel, e),
                        }
                    });
                }
                Err(e) => error!("Failed to start relay: {}", e),
            }
        }

        let supervisor = self.supervisor.clone();
        let trigger = closing.clone();
        tokio::spawn(async move {
            shutdown.await;
            info!("Shutting down relay session...");
            let snapshot = supervisor.stop().await;
            info!("Session ended in state {}", snapshot.state);
            trigger.cancel();
        });

        let result = server.run().await;

        // 服务异常退出时同样要结束转码进程
        if !closing.is_cancelled() {
            self.supervisor.stop().await;
            closing.cancel();
        }

        result
    }
}
