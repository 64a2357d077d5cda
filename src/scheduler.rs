//! 周期任务运行器
//!
//! ## 职责
//!
//! 持有一个显式启停的后台循环：固定间隔触发注入的任务体，
//! 同一时刻至多一次在途执行（触发时上一轮还没结束就跳过本轮）。
//! 任务体做什么由嵌入方决定，这里只管生命周期。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, Result};

/// 周期任务体：每次触发执行一次，返回错误时记入状态
pub type ScheduledJob =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// 运行器状态的拷贝
#[derive(Debug, Clone, Default)]
pub struct RunnerStatus {
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: String,
}

#[derive(Default)]
struct RunnerState {
    status: RunnerStatus,
    /// 触发间隔内上一轮还没结束时跳过本轮
    run_in_flight: bool,
    cancel: Option<CancellationToken>,
}

/// 周期任务运行器
#[derive(Clone, Default)]
pub struct PeriodicRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl PeriodicRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动后台循环；已在运行时报错
    pub fn start(&self, interval: Duration, job: ScheduledJob) -> Result<()> {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            if state.cancel.is_some() {
                return Err(AppError::InvalidInput("调度器已在运行".to_string()));
            }
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            state.status.running = true;
            cancel
        };

        info!("⏰ 周期任务启动，间隔 {:?}", interval);
        let runner = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                runner.run_once(&job).await;
            }
            let mut state = runner.state.lock().unwrap();
            state.status.running = false;
            state.cancel = None;
            info!("⏹️ 周期任务已停止");
        });
        Ok(())
    }

    /// 停止后台循环，在途的一轮跑完为止
    pub fn stop(&self) {
        let cancel = self.state.lock().unwrap().cancel.clone();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// 返回状态拷贝
    pub fn status(&self) -> RunnerStatus {
        self.state.lock().unwrap().status.clone()
    }

    async fn run_once(&self, job: &ScheduledJob) {
        {
            let mut state = self.state.lock().unwrap();
            if state.run_in_flight {
                return;
            }
            state.run_in_flight = true;
        }

        let started_at = Utc::now();
        let outcome = job().await;

        let mut state = self.state.lock().unwrap();
        state.run_in_flight = false;
        state.status.last_run_at = Some(started_at);
        match outcome {
            Ok(()) => state.status.last_error.clear(),
            Err(e) => {
                warn!("周期任务执行失败: {}", e);
                state.status.last_error = e.to_string();
            }
        }
    }
}
