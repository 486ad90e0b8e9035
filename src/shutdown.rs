use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 优雅关闭管理器
///
/// 第一次收到信号时取消令牌，由调度器负责停止Worker并汇总结果。
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅关闭信号
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发关闭，正在停止所有Worker");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 在后台监听 Ctrl+C / SIGTERM
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_shutdown_signal() => manager.shutdown(),
                _ = manager.wait_for_shutdown() => {}
            }
        })
    }
}

/// 等待关闭信号
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}

/// Worker子进程与父进程同属一个进程组，终端的Ctrl+C也会发给它。
/// 停止由父进程通过shutdown指令统一安排，这里只记录并忽略。
pub fn ignore_interrupts() -> JoinHandle<()> {
    tokio::spawn(async {
        loop {
            if let Err(e) = signal::ctrl_c().await {
                warn!("无法监听中断信号: {e}");
                return;
            }
            debug!("Worker 忽略中断信号，等待父进程指令");
        }
    })
}
