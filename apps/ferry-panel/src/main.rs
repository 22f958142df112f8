mod auth;
mod bot;
mod cli;
mod config;
mod error;
mod handlers;
mod jobs;
mod services;
mod utils;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use chrono::{Duration, FixedOffset, NaiveDate};
use clap::{Parser, Subcommand};
use ferry_db::db::init_db;
use ferry_db::repositories::user_repo::UserRepository;
use sqlx::PgPool;
use teloxide::Bot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::PanelConfig;
use services::{
    auth_service::AuthService, cache_service::CacheService, commission_service::CommissionService,
    coupon_service::CouponService, mail_service::MailService, notification_service::NotificationService,
    order_service::OrderService, passport_service::PassportService, payment::PaymentService,
    plan_service::PlanService, server_service::ServerService, stat_service::StatService,
    subscription::SubscriptionService, traffic_reset_service::TrafficResetService,
    traffic_service::TrafficService, user_service::UserService,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<PanelConfig>,
    pub tz: FixedOffset,
    pub bot: Option<Bot>,

    pub auth_service: Arc<AuthService>,
    pub mail_service: Arc<MailService>,
    pub passport_service: Arc<PassportService>,
    pub user_service: Arc<UserService>,
    pub order_service: Arc<OrderService>,
    pub plan_service: Arc<PlanService>,
    pub coupon_service: Arc<CouponService>,
    pub commission_service: Arc<CommissionService>,
    pub payment_service: Arc<PaymentService>,
    pub server_service: Arc<ServerService>,
    pub subscription_service: Arc<SubscriptionService>,
    pub traffic_service: Arc<TrafficService>,
    pub traffic_reset_service: Arc<TrafficResetService>,
    pub stat_service: Arc<StatService>,
}

#[derive(Parser)]
#[command(name = "ferry-panel")]
#[command(about = "Ferry proxy subscription panel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API, the bot and the background jobs
    Serve,
    /// Reset traffic for every subscription due today
    ResetTraffic,
    /// Cancel stale orders and open paid ones
    CheckOrder,
    /// Approve and pay out pending commissions
    CheckCommission,
    /// Record the daily statistics row
    RecordStat {
        /// Day to record, defaults to yesterday
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Send expiry and traffic reminder mail
    SendRemindMail,
    /// Administrative tools
    Admin {
        #[command(subcommand)]
        subcommand: AdminCommands,
    },
    /// Install the panel as a systemd service
    Install,
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Reset (or create) an administrator account
    ResetPassword {
        /// Email of the admin
        email: String,
        /// New password
        new_pass: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("Warning: Failed to load .env file: {}", e);
    }

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ferry_panel=debug,axum=info,tower_http=info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A TLS crypto provider was already installed");
    }

    match cli.command {
        Commands::Serve => {
            let (config, pool) = connect().await?;
            config.validate_for_serve()?;
            let state = build_state(config, pool).await?;
            run_server(state).await?;
        }
        Commands::ResetTraffic => {
            let state = connect_state().await?;
            let count = state
                .traffic_reset_service
                .run(utils::local_today(&state.tz))
                .await?;
            println!("Traffic reset for {} users.", count);
        }
        Commands::CheckOrder => {
            let state = connect_state().await?;
            let (cancelled, opened) = state.order_service.check_orders().await?;
            println!("{} orders cancelled, {} orders opened.", cancelled, opened);
        }
        Commands::CheckCommission => {
            let state = connect_state().await?;
            let (approved, paid) = jobs::check_commission(&state).await?;
            println!("{} commissions approved, {} paid out.", approved, paid);
        }
        Commands::RecordStat { date } => {
            let state = connect_state().await?;
            let date = date.unwrap_or_else(|| utils::local_today(&state.tz) - Duration::days(1));
            let record = state.stat_service.record_daily(date).await?;
            println!("Recorded {}: {:?}", date, record);
        }
        Commands::SendRemindMail => {
            let (config, pool) = connect().await?;
            let mail = MailService::new(config.mail.clone())?;
            let users = UserRepository::new(pool);
            let (expiring, heavy) = jobs::send_remind_mail(&users, &mail, &config.site).await?;
            println!("{} expiry and {} traffic reminders sent.", expiring, heavy);
        }
        Commands::Admin { subcommand } => match subcommand {
            AdminCommands::ResetPassword { email, new_pass } => {
                let (_, pool) = connect().await?;
                cli::reset_password(&pool, &email, &new_pass).await?;
            }
        },
        Commands::Install => {
            cli::install_service()?;
        }
    }

    Ok(())
}

async fn connect() -> Result<(PanelConfig, PgPool)> {
    let config = PanelConfig::load()?;
    let pool = init_db(&config.database.url, config.database.max_connections).await?;
    Ok((config, pool))
}

async fn connect_state() -> Result<AppState> {
    let (config, pool) = connect().await?;
    build_state(config, pool).await
}

async fn build_state(config: PanelConfig, pool: PgPool) -> Result<AppState> {
    let tz = config.timezone();
    let cache = CacheService::new(&config.redis.url).await?;

    let bot = (config.telegram.bot_enable && !config.telegram.bot_token.is_empty())
        .then(|| Bot::new(&config.telegram.bot_token));

    let auth = AuthService::new(cache.clone(), config.auth.jwt_secret.clone(), config.auth.session_ttl_days);
    let mail = MailService::new(config.mail.clone())?;
    let commission = CommissionService::new(pool.clone(), config.commission.clone());
    let payments = PaymentService::new(pool.clone(), config.site.app_url.clone());
    let notifier = NotificationService::new(pool.clone(), bot.clone(), config.commission.clone());
    let orders = OrderService::new(
        pool.clone(),
        commission.clone(),
        payments.clone(),
        notifier,
        config.order.clone(),
        config.register.try_out_plan_id,
        tz,
    );
    let servers = ServerService::new(pool.clone());
    let reset = TrafficResetService::new(pool.clone(), config.traffic.reset_traffic_method, tz);
    let subscription = SubscriptionService::new(pool.clone(), servers.clone(), reset.clone(), config.site.clone(), tz);
    let passport = PassportService::new(
        pool.clone(),
        cache.clone(),
        auth.clone(),
        mail.clone(),
        orders.clone(),
        config.register.clone(),
        config.site.clone(),
    );
    let users = UserService::new(
        pool.clone(),
        auth.clone(),
        subscription.clone(),
        config.register.clone(),
        config.commission.clone(),
    );
    let traffic = TrafficService::new(pool.clone(), servers.clone(), cache, config.server.node_token.clone(), tz);

    Ok(AppState {
        pool: pool.clone(),
        config: Arc::new(config),
        tz,
        bot,
        auth_service: Arc::new(auth),
        mail_service: Arc::new(mail),
        passport_service: Arc::new(passport),
        user_service: Arc::new(users),
        order_service: Arc::new(orders),
        plan_service: Arc::new(PlanService::new(pool.clone())),
        coupon_service: Arc::new(CouponService::new(pool.clone())),
        commission_service: Arc::new(commission),
        payment_service: Arc::new(payments),
        server_service: Arc::new(servers),
        subscription_service: Arc::new(subscription),
        traffic_service: Arc::new(traffic),
        traffic_reset_service: Arc::new(reset),
        stat_service: Arc::new(StatService::new(pool, tz)),
    })
}

fn app(state: AppState) -> Router {
    let admin_path = format!("/api/v1/{}", state.config.secure_path());

    Router::new()
        .nest("/api/v1/passport", handlers::passport::routes())
        .nest("/api/v1/guest", handlers::guest::routes())
        .nest("/api/v1/user", handlers::user::routes(state.clone()))
        .nest("/api/v1/server/UniProxy", handlers::node::routes(state.clone()))
        .nest(&admin_path, handlers::admin::routes(state.clone()))
        .merge(handlers::client::routes(&state.config.site))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::compression::CompressionLayer::new())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(10 * 1024 * 1024))
        .layer(tower_http::set_header::SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            axum::http::HeaderValue::from_static("nosniff"),
        ))
        .layer(tower_http::set_header::SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            axum::http::HeaderValue::from_static("DENY"),
        ))
        .layer(tower_http::set_header::SetResponseHeaderLayer::overriding(
            axum::http::header::X_XSS_PROTECTION,
            axum::http::HeaderValue::from_static("1; mode=block"),
        ))
}

async fn run_server(state: AppState) -> Result<()> {
    if let Some(bot) = state.bot.clone() {
        let bot_state = state.clone();
        tokio::spawn(async move {
            bot::run_bot(bot, bot_state).await;
        });
    } else {
        info!("Telegram bot disabled");
    }

    jobs::spawn_all(state.clone());

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    info!("Admin API mounted at /api/v1/{}", state.config.secure_path());
    let app = app(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
