use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use cinema_api::{
    config::AppConfig,
    db::{self, DbPool},
    entities::{movie, MovieModel},
    events::{self, EventSender},
    handlers::AppServices,
    message_queue::{InMemoryMessageQueue, Message, MessageQueue},
    services::notifications::EMAIL_TOPIC,
    services::payments::{
        ChargeRequest, GatewayCharge, GatewayChargeState, GatewayChargeStatus, GatewayError,
        PaymentGateway,
    },
};

/// Behavior of the next scripted charge call.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum ChargeScript {
    Succeed,
    Decline(String),
    Timeout,
}

/// Payment gateway test double: records every charge, plays back scripted
/// results, and serves lookup ground truth from a programmable table.
pub struct ScriptedGateway {
    charges: Mutex<Vec<ChargeRequest>>,
    charge_results: Mutex<VecDeque<ChargeScript>>,
    lookups: Mutex<HashMap<String, GatewayChargeStatus>>,
    counter: AtomicU32,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            charges: Mutex::new(Vec::new()),
            charge_results: Mutex::new(VecDeque::new()),
            lookups: Mutex::new(HashMap::new()),
            counter: AtomicU32::new(0),
        }
    }

    /// Queue the behavior for the next charge; default is success.
    #[allow(dead_code)]
    pub fn push_charge_result(&self, script: ChargeScript) {
        self.charge_results.lock().unwrap().push_back(script);
    }

    /// Program the lookup answer for an idempotency key.
    #[allow(dead_code)]
    pub fn set_lookup(
        &self,
        idempotency_key: &str,
        state: GatewayChargeState,
        reference: Option<&str>,
    ) {
        self.lookups.lock().unwrap().insert(
            idempotency_key.to_string(),
            GatewayChargeStatus {
                gateway_reference: reference.map(str::to_string),
                state,
            },
        );
    }

    /// Every charge request recorded so far.
    #[allow(dead_code)]
    pub fn recorded_charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: ChargeRequest) -> Result<GatewayCharge, GatewayError> {
        self.charges.lock().unwrap().push(request);
        let script = self
            .charge_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ChargeScript::Succeed);

        match script {
            ChargeScript::Succeed => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(GatewayCharge {
                    gateway_reference: format!("gw_{}", n),
                    payment_url: format!("https://pay.test/session/{}", n),
                })
            }
            ChargeScript::Decline(reason) => Err(GatewayError::Declined(reason)),
            ChargeScript::Timeout => Err(GatewayError::Timeout),
        }
    }

    async fn lookup(&self, idempotency_key: &str) -> Result<GatewayChargeStatus, GatewayError> {
        Ok(self
            .lookups
            .lock()
            .unwrap()
            .get(idempotency_key)
            .cloned()
            .unwrap_or(GatewayChargeStatus {
                gateway_reference: None,
                state: GatewayChargeState::NotFound,
            }))
    }
}

/// Test application: the full service stack over an in-memory SQLite
/// database with the embedded migrator, an in-memory notification queue
/// and a scripted gateway.
pub struct TestApp {
    pub services: AppServices,
    pub db: Arc<DbPool>,
    pub queue: Arc<InMemoryMessageQueue>,
    pub gateway: Arc<ScriptedGateway>,
    #[allow(dead_code)]
    pub config: Arc<AppConfig>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Minimal configuration suitable for tests.
    pub fn test_config() -> AppConfig {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "test_secret_key_for_testing_purposes_only_with_sixty_four_chars!".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        // A single connection keeps the whole suite on one in-memory database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg
    }

    pub async fn new() -> Self {
        Self::with_config(Self::test_config()).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let cfg = Arc::new(cfg);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let queue = Arc::new(InMemoryMessageQueue::new());
        let gateway = Arc::new(ScriptedGateway::new());

        let services = AppServices::new(
            db_arc.clone(),
            Arc::new(event_sender),
            gateway.clone(),
            queue.clone(),
            cfg.clone(),
        );

        Self {
            services,
            db: db_arc,
            queue,
            gateway,
            config: cfg,
            _event_task: event_task,
        }
    }

    /// Insert a movie directly; catalog-service creation is exercised by
    /// its own tests.
    pub async fn seed_movie(&self, title: &str, price: Decimal, available: bool) -> MovieModel {
        let now = Utc::now();
        movie::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(title.to_string()),
            description: Set(None),
            price: Set(price),
            available: Set(available),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed movie for tests")
    }

    /// Drain and return all queued notification emails.
    #[allow(dead_code)]
    pub async fn drain_emails(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = self
            .queue
            .subscribe(EMAIL_TOPIC)
            .await
            .expect("queue subscribe")
        {
            messages.push(message);
        }
        messages
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}
