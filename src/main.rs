use std::sync::Arc;

use anyhow::{Error, Result};
use dispatch_service::{
    api::{AppState, WebhookSettings, run_api_server},
    batch::{BatchIngestor, CsvReader},
    clients::{
        circuit_breaker::CircuitBreaker, database::PostgresStore, health::HealthChecker,
        mailgun::MailgunEmailGateway, memory::MemoryStore, rbmq::RabbitMqClient, redis,
        twilio::TwilioSmsGateway,
    },
    config::Config,
    dispatcher::MessageDispatcher,
    reconciler::StatusReconciler,
    store::{BatchRepository, MessageStore, TemplateRepository},
    suppression::{ClaimRegistry, DuplicateSuppressionIndex, MemoryClaims},
    templates::TemplateStore,
    worker::{BatchScheduler, TaskWorker},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = Config::load()?;
    info!("Configuration loaded");

    let mut health_checker = HealthChecker::new();

    let (messages, templates, batches): (
        Arc<dyn MessageStore>,
        Arc<dyn TemplateRepository>,
        Arc<dyn BatchRepository>,
    ) = match &config.database_url {
        Some(url) => {
            let store = Arc::new(PostgresStore::connect(url, config.persistence_timeout()).await?);
            health_checker = health_checker.with_database(store.clone());
            (store.clone(), store.clone(), store)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store.clone(), store)
        }
    };

    let mut sms_gateway = TwilioSmsGateway::new(&config)?;
    let mut email_gateway = MailgunEmailGateway::new(&config)?;

    let claims: Arc<dyn ClaimRegistry> = match &config.redis_url {
        Some(url) => {
            let connection = redis::connect(url).await?;

            let twilio_breaker = CircuitBreaker::new(
                "twilio".to_string(),
                connection.clone(),
                config.circuit_breaker_config(),
            );
            let mailgun_breaker = CircuitBreaker::new(
                "mailgun".to_string(),
                connection.clone(),
                config.circuit_breaker_config(),
            );

            sms_gateway = sms_gateway.with_circuit_breaker(twilio_breaker.clone());
            email_gateway = email_gateway.with_circuit_breaker(mailgun_breaker.clone());

            health_checker = health_checker
                .with_redis(connection.clone())
                .with_circuit_breaker(twilio_breaker)
                .with_circuit_breaker(mailgun_breaker);

            Arc::new(redis::RedisClaims::new(connection))
        }
        None => {
            warn!("REDIS_URL not set, using in-process claims and no circuit breakers");
            Arc::new(MemoryClaims::new())
        }
    };

    let rabbitmq = match &config.rabbitmq_url {
        Some(url) => {
            let client = Arc::new(
                RabbitMqClient::connect(
                    url,
                    &config.task_queue_name,
                    &config.failed_queue_name,
                    config.prefetch_count,
                )
                .await?,
            );
            health_checker = health_checker.with_rabbitmq(client.clone());
            Some(client)
        }
        None => {
            warn!("RABBITMQ_URL not set, batches are expanded in process");
            None
        }
    };

    let suppression = Arc::new(DuplicateSuppressionIndex::new(
        messages.clone(),
        claims,
        config.suppression_window(),
        config.claim_ttl(),
    ));

    let dispatcher = Arc::new(MessageDispatcher::new(
        TemplateStore::new(templates, messages.clone()),
        messages.clone(),
        suppression,
        Arc::new(sms_gateway),
        Arc::new(email_gateway),
        config.dispatcher_config(),
    ));

    let ingestor = Arc::new(
        BatchIngestor::new(dispatcher.clone(), batches, Arc::new(CsvReader::default()))
            .with_lease(config.batch_lease()),
    );

    let scheduler = BatchScheduler::new(
        ingestor.clone(),
        rabbitmq.clone(),
        config.batch_poll_interval(),
    );
    tokio::spawn(scheduler.run());

    if let Some(rabbitmq) = rabbitmq {
        let worker = TaskWorker::new(
            rabbitmq,
            dispatcher.clone(),
            ingestor.clone(),
            config.worker_concurrency,
        );
        tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!(error = %e, "Task worker stopped");
            }
        });
    }

    let state = Arc::new(AppState {
        dispatcher,
        reconciler: Arc::new(StatusReconciler::new(messages.clone())),
        ingestor,
        messages,
        health_checker,
        webhooks: WebhookSettings {
            public_base_url: config.public_base_url.clone(),
            twilio_auth_token: config.twilio_auth_token.clone(),
            mailgun_signing_key: config.mailgun_webhook_signing_key.clone(),
        },
    });

    tokio::select! {
        result = run_api_server(state, config.server_port) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    Ok(())
}
