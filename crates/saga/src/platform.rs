//! Both services on one broker.

use std::sync::Arc;
use std::time::Duration;

use broker::{CheckBackOptions, Consumer, MessageBroker, RetryPolicy, TagFilter, TransactionalPublisher};
use common::topics;
use order::{OrderService, OrderStore, OrderTransactionListener, SETTLEMENT_TAGS, SettlementConsumer};
use outbox::{DispatcherConfig, OutboxDispatcher, OutboxStore};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use wallet::consumers::{FOLLOW_EVENT_TAGS, ORDER_EVENT_TAGS};
use wallet::{
    CompanionService, FollowConsumer, OrderEventsConsumer, RefundTransactionListener, UserStore, WalletService,
};

use crate::client::LocalUserClient;
use crate::error::{PlatformError, Result};

/// Settle gives up after this many rounds that still found work.
const MAX_SETTLE_ROUNDS: usize = 256;

/// Timing and retry settings shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct PlatformOptions {
    pub check_back: CheckBackOptions,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
}

impl Default for PlatformOptions {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::new("", "");
        Self {
            check_back: CheckBackOptions::default(),
            retry: RetryPolicy::default(),
            poll_interval: dispatcher.poll_interval,
            batch_size: dispatcher.batch_size,
            max_attempts: dispatcher.max_attempts,
        }
    }
}

impl PlatformOptions {
    /// Check-backs fire on the first look and retries are immediate.
    /// Meant for tests that drive the platform with [`Platform::settle`].
    pub fn immediate() -> Self {
        Self {
            check_back: CheckBackOptions {
                check_after: Duration::ZERO,
                interval: Duration::from_millis(10),
                max_checks: 15,
            },
            retry: RetryPolicy {
                max_attempts: 5,
                backoff: Duration::ZERO,
            },
            poll_interval: Duration::from_millis(10),
            ..Self::default()
        }
    }

    fn dispatcher(&self, service: &str) -> DispatcherConfig {
        let mut config = DispatcherConfig::new(service, topics::ORDER_EVENTS);
        config.poll_interval = self.poll_interval;
        config.batch_size = self.batch_size;
        config.max_attempts = self.max_attempts;
        config
    }
}

/// Work done by one [`Platform::settle`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub rounds: usize,
    pub dispatched: usize,
    pub checked: usize,
    pub consumed: usize,
}

/// Order and wallet services wired onto one broker, with every
/// listener, consumer and dispatcher the saga needs.
pub struct Platform<U, O> {
    broker: Arc<dyn MessageBroker>,
    wallet: WalletService<U>,
    companions: CompanionService<U>,
    orders: OrderService<O>,
    publishers: Vec<TransactionalPublisher>,
    dispatchers: Vec<Arc<OutboxDispatcher>>,
    consumers: Mutex<Vec<Consumer>>,
}

impl<U, O> Platform<U, O>
where
    U: UserStore + OutboxStore + Clone + 'static,
    O: OrderStore + OutboxStore + Clone + 'static,
{
    /// Registers the listeners and opens the consumer subscriptions.
    /// Messages published before this call are not delivered.
    pub async fn new(
        broker: Arc<dyn MessageBroker>,
        user_store: U,
        order_store: O,
        options: PlatformOptions,
    ) -> Result<Self> {
        let wallet = WalletService::new(user_store.clone());
        let companions = CompanionService::new(user_store.clone());

        let refunds = TransactionalPublisher::new(
            broker.clone(),
            wallet::PRODUCER_GROUP,
            Arc::new(RefundTransactionListener::new(wallet.clone())),
            options.check_back,
        );
        let order_tx = TransactionalPublisher::new(
            broker.clone(),
            order::PRODUCER_GROUP,
            Arc::new(OrderTransactionListener::new(order_store.clone())),
            options.check_back,
        );
        let orders = OrderService::new(
            order_store.clone(),
            Arc::new(LocalUserClient::new(user_store.clone())),
            order_tx.clone(),
        );

        let wallet_orders = broker
            .subscribe(topics::ORDER_EVENTS, wallet::CONSUMER_GROUP, TagFilter::parse(ORDER_EVENT_TAGS))
            .await?;
        let wallet_follows = broker
            .subscribe(topics::FOLLOW_EVENTS, wallet::CONSUMER_GROUP, TagFilter::parse(FOLLOW_EVENT_TAGS))
            .await?;
        let order_settlement = broker
            .subscribe(topics::ORDER_EVENTS, order::CONSUMER_GROUP, TagFilter::parse(SETTLEMENT_TAGS))
            .await?;
        let consumers = vec![
            Consumer::new(
                wallet_orders,
                Arc::new(OrderEventsConsumer::new(wallet.clone(), refunds.clone())),
                options.retry,
            ),
            Consumer::new(wallet_follows, Arc::new(FollowConsumer::new(user_store.clone())), options.retry),
            Consumer::new(order_settlement, Arc::new(SettlementConsumer::new(order_store.clone())), options.retry),
        ];

        let dispatchers = vec![
            Arc::new(OutboxDispatcher::new(
                Arc::new(user_store),
                broker.clone(),
                options.dispatcher("user-service"),
            )),
            Arc::new(OutboxDispatcher::new(
                Arc::new(order_store),
                broker.clone(),
                options.dispatcher("order-service"),
            )),
        ];

        tracing::info!(consumers = consumers.len(), dispatchers = dispatchers.len(), "platform wired");
        Ok(Self {
            broker,
            wallet,
            companions,
            orders,
            publishers: vec![order_tx, refunds],
            dispatchers,
            consumers: Mutex::new(consumers),
        })
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn wallet(&self) -> &WalletService<U> {
        &self.wallet
    }

    pub fn companions(&self) -> &CompanionService<U> {
        &self.companions
    }

    pub fn orders(&self) -> &OrderService<O> {
        &self.orders
    }

    /// Pumps dispatchers, check-backs and consumers in rounds until a
    /// round finds nothing to do.
    ///
    /// Consumers handed to [`Platform::spawn`] are no longer drained here.
    pub async fn settle(&self) -> Result<SettleReport> {
        let mut report = SettleReport::default();
        let mut consumers = self.consumers.lock().await;

        while report.rounds < MAX_SETTLE_ROUNDS {
            report.rounds += 1;
            let (mut dispatched, mut checked, mut consumed) = (0, 0, 0);

            for dispatcher in &self.dispatchers {
                dispatched += dispatcher.dispatch_once().await?.sent;
            }
            // Unresolved checks are not progress: they stay pending until
            // the listener can answer or the check budget runs out.
            for publisher in &self.publishers {
                let checks = publisher.check_pending().await?;
                checked += checks.committed + checks.rolled_back;
            }
            for consumer in consumers.iter_mut() {
                consumed += consumer.drain().await;
            }

            report.dispatched += dispatched;
            report.checked += checked;
            report.consumed += consumed;
            if dispatched + checked + consumed == 0 {
                metrics::histogram!("platform_settle_rounds").record(report.rounds as f64);
                tracing::debug!(rounds = report.rounds, "platform settled");
                return Ok(report);
            }
        }

        Err(PlatformError::Unsettled { rounds: report.rounds })
    }

    /// Starts every worker on the runtime. They stop together when the
    /// returned [`Workers`] is shut down.
    pub async fn spawn(&self) -> Workers {
        let (tx, rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for dispatcher in &self.dispatchers {
            let dispatcher = dispatcher.clone();
            let shutdown = rx.clone();
            tasks.spawn(async move { dispatcher.run(shutdown).await });
        }
        for publisher in &self.publishers {
            let publisher = publisher.clone();
            let shutdown = rx.clone();
            tasks.spawn(async move { publisher.run(shutdown).await });
        }
        for consumer in self.consumers.lock().await.drain(..) {
            tasks.spawn(consumer.run(rx.clone()));
        }

        tracing::info!(workers = tasks.len(), "platform workers started");
        Workers { shutdown: tx, tasks }
    }
}

/// Handle to the background workers of a [`Platform`].
pub struct Workers {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Workers {
    /// Signals every worker and waits for them. Batches and deliveries
    /// in progress finish first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker ended abnormally");
            }
        }
        tracing::info!("platform workers stopped");
    }
}
