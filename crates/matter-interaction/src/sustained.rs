//! 持续订阅：断线自动重建的客户端包装。
//!
//! # 语义（What）
//! - 底层订阅因超时、对端停机或网络丢失而关闭后，包装层调用注入的
//!   重建闭包（重新发现 + 以原路径集重订阅）；
//! - `active`/`inactive` 两个状态经 watch 通道暴露；每次重建后的
//!   `subscriptionId` 都是新值；
//! - 超时判定：对端在 `maxInterval + 宽限` 内既无变更报告也无保活，
//!   即认定底层订阅失效。

use crate::client::ClientSubscription;
use crate::messages::AttributeReport;
use matter_core::clock::Clock;
use matter_core::error::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// 重建失败后的退避。
const REESTABLISH_BACKOFF: Duration = Duration::from_secs(2);

/// 报告超时的宽限：maxInterval 的十分之一加一秒。
pub fn report_grace(max_interval: Duration) -> Duration {
    max_interval / 10 + Duration::from_secs(1)
}

/// 重建闭包：每次调用产出一条全新的底层订阅。
pub type Reestablisher = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<ClientSubscription>> + Send>> + Send + Sync,
>;

/// 报告消费者。
pub type ReportSink = Arc<dyn Fn(Vec<AttributeReport>) + Send + Sync>;

/// 持续订阅句柄。
pub struct SustainedSubscription {
    active: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
    current_id: Arc<Mutex<Option<u32>>>,
}

impl SustainedSubscription {
    /// 启动维持循环。
    pub fn start(clock: Arc<dyn Clock>, establish: Reestablisher, sink: ReportSink) -> Arc<Self> {
        let (active_tx, active_rx) = watch::channel(false);
        let (closed_tx, mut closed_rx) = watch::channel(false);
        let current_id = Arc::new(Mutex::new(None::<u32>));

        let handle_id = Arc::clone(&current_id);
        tokio::spawn(async move {
            loop {
                if *closed_rx.borrow() {
                    break;
                }
                match establish().await {
                    Ok(mut subscription) => {
                        info!(
                            id = subscription.subscription_id,
                            "sustained subscription established"
                        );
                        *handle_id.lock().expect("id lock") = Some(subscription.subscription_id);
                        let _ = active_tx.send(true);
                        sink(subscription.baseline.drain(..).collect());

                        let timeout =
                            subscription.max_interval + report_grace(subscription.max_interval);
                        loop {
                            tokio::select! {
                                report = subscription.next_report(timeout) => match report {
                                    Ok(report) => sink(report),
                                    Err(err) => {
                                        debug!(error = %err, "underlying subscription lost");
                                        break;
                                    }
                                },
                                _ = closed_rx.changed() => {}
                            }
                            if *closed_rx.borrow() {
                                break;
                            }
                        }
                        let _ = active_tx.send(false);
                    }
                    Err(err) => {
                        debug!(error = %err, "subscription reestablishment failed");
                        let _ = active_tx.send(false);
                        clock.sleep(REESTABLISH_BACKOFF).await;
                    }
                }
            }
            let _ = active_tx.send(false);
        });

        Arc::new(Self {
            active: active_rx,
            closed: closed_tx,
            current_id,
        })
    }

    /// 当前是否有活动的底层订阅。
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// 当前底层订阅号（inactive 期间保留最后一次的值）。
    pub fn subscription_id(&self) -> Option<u32> {
        *self.current_id.lock().expect("id lock")
    }

    /// 等待进入目标状态。
    pub async fn wait_for(&self, target: bool) {
        let mut receiver = self.active.clone();
        loop {
            if *receiver.borrow() == target {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// 终止维持循环并拆除底层订阅。
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }
}

impl Drop for SustainedSubscription {
    fn drop(&mut self) {
        let _ = self.closed.send(true);
    }
}
