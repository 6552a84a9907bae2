//! habitlinkd - The habitlink background service
//!
//! This is the main entry point for the habitlinkd service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Habit engine, recurrence engine and reminder scanner
//! - Scheduler
//! - IPC server

use anyhow::{Context, Result};
use clap::Parser;
use habitlink_api::{
    Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, RecurrenceAction, Response,
    ResponsePayload,
};
use habitlink_config::{load_config_or_default, ServiceConfig};
use habitlink_core::{
    BoundedStore, HabitEngine, RecurrenceEngine, ReminderScanner, Scheduler, SchedulerConfig,
    SchedulerEvent,
};
use habitlink_ipc::{IpcServer, ServerMessage};
use habitlink_store::{AuditEventType, HabitStore, SqliteStore};
use habitlink_util::{default_config_path, ClientId, RateLimiter, SystemClock, TimeSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Requests each client may make per second
const REQUESTS_PER_SECOND: u32 = 30;

/// habitlinkd - Habit tracking lifecycle service
#[derive(Parser, Debug)]
#[command(name = "habitlinkd")]
#[command(about = "Habit recurrence and reminder scheduling service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/habitlink/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set HABITLINK_SOCKET env var)
    #[arg(short, long, env = "HABITLINK_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set HABITLINK_DATA_DIR env var)
    #[arg(short, long, env = "HABITLINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Shared handles used by request handlers
struct Shared {
    engine: HabitEngine,
    scanner: Arc<ReminderScanner>,
    scheduler: Scheduler,
    ipc: Arc<IpcServer>,
    clock: Arc<dyn TimeSource>,
}

/// Main service state
struct Service {
    ctx: Arc<Shared>,
    store: BoundedStore,
    scheduler_events: mpsc::UnboundedReceiver<SchedulerEvent>,
    autostart: bool,
    rate_limiter: RateLimiter,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let mut config = load_config_or_default(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;
        apply_overrides(&mut config, args);

        info!(
            config_path = %args.config.display(),
            reschedule = ?config.reschedule,
            leaderboard_limit = config.leaderboard_limit,
            "Configuration loaded"
        );

        let data_dir = &config.service.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = config.service.database_path();
        let budget = BoundedStore::backend_budget(config.service.store_timeout);
        let sqlite: Arc<dyn HabitStore> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?
                .with_budget(budget),
        );
        let store = BoundedStore::new(sqlite, config.service.store_timeout);

        info!(
            db_path = %db_path.display(),
            timeout = ?config.service.store_timeout,
            budget = ?budget,
            "Store initialized"
        );

        store.audit(AuditEventType::ServiceStarted).await;
        store
            .audit(AuditEventType::ConfigLoaded {
                reschedule: format!("{:?}", config.reschedule),
            })
            .await;

        let clock: Arc<dyn TimeSource> = Arc::new(SystemClock);
        let engine = HabitEngine::new(store.clone(), clock.clone(), config.leaderboard_limit);
        let recurrence = Arc::new(RecurrenceEngine::new(store.clone()));
        let scanner = Arc::new(ReminderScanner::new(store.clone(), config.reschedule));
        let (scheduler, scheduler_events) = Scheduler::new(
            recurrence,
            scanner.clone(),
            clock.clone(),
            SchedulerConfig::from(&config.scheduler),
        );

        let socket_path = config.service.socket_path.clone();
        let mut ipc = IpcServer::new(&socket_path);
        ipc.start()
            .await
            .with_context(|| format!("Failed to bind socket {:?}", socket_path))?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            ctx: Arc::new(Shared {
                engine,
                scanner,
                scheduler,
                ipc: Arc::new(ipc),
                clock,
            }),
            store,
            scheduler_events,
            autostart: config.scheduler.autostart,
            rate_limiter: RateLimiter::new(REQUESTS_PER_SECOND, Duration::from_secs(1)),
        })
    }

    async fn run(self) -> Result<()> {
        let Service {
            ctx,
            store,
            mut scheduler_events,
            autostart,
            mut rate_limiter,
        } = self;

        let mut ipc_messages = ctx
            .ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        let ipc_accept = ctx.ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        if autostart {
            ctx.scheduler.start().context("Failed to start scheduler")?;
        } else {
            info!("Scheduler autostart disabled");
        }

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                Some(event) = scheduler_events.recv() => {
                    broadcast_scheduler_event(&ctx.ipc, event);
                }

                Some(msg) = ipc_messages.recv() => {
                    handle_ipc_message(&ctx, &store, &mut rate_limiter, msg).await;
                }
            }
        }

        info!("Shutting down habitlinkd");

        if ctx.scheduler.is_running()
            && let Err(e) = ctx.scheduler.stop().await
        {
            warn!(error = %e, "Failed to stop scheduler");
        }

        // Jobs that finished during shutdown still notify subscribers.
        while let Ok(event) = scheduler_events.try_recv() {
            broadcast_scheduler_event(&ctx.ipc, event);
        }

        store.audit(AuditEventType::ServiceStopped).await;
        ctx.ipc.shutdown();

        info!("Shutdown complete");
        Ok(())
    }
}

fn apply_overrides(config: &mut ServiceConfig, args: &Args) {
    if let Some(socket) = &args.socket {
        config.service.socket_path = socket.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.service.data_dir = data_dir.clone();
    }
}

/// Turn job output into events for subscribers
fn broadcast_scheduler_event(ipc: &IpcServer, event: SchedulerEvent) {
    match event {
        SchedulerEvent::Recurrence(outcomes) => {
            for outcome in outcomes {
                let payload = match outcome.action {
                    RecurrenceAction::Reset => EventPayload::HabitReset {
                        habit_id: outcome.habit_id,
                        user_id: outcome.owner_id,
                    },
                    RecurrenceAction::Recreated { new_id } => EventPayload::HabitRecreated {
                        old_id: outcome.habit_id,
                        new_id,
                        user_id: outcome.owner_id,
                    },
                };
                ipc.broadcast_event(Event::new(payload));
            }
        }
        SchedulerEvent::Reminders(reminders) => {
            debug!(count = reminders.len(), "Publishing due reminders");
            for reminder in reminders {
                ipc.broadcast_event(Event::new(EventPayload::ReminderDue {
                    habit_id: reminder.habit_id,
                    user_id: reminder.owner_id,
                    message: reminder.message,
                    next_reminder: reminder.next_reminder,
                }));
            }
        }
    }
}

async fn handle_ipc_message(
    ctx: &Arc<Shared>,
    store: &BoundedStore,
    rate_limiter: &mut RateLimiter,
    msg: ServerMessage,
) {
    match msg {
        ServerMessage::Request { client_id, request } => {
            if !rate_limiter.check(&client_id) {
                let response = Response::error(
                    request.request_id,
                    ErrorInfo::new(ErrorCode::RateLimited, "Too many requests"),
                );
                let _ = ctx.ipc.send_response(&client_id, response).await;
                return;
            }

            // Handlers wait on the store; run them off the event loop.
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let response =
                    handle_command(&ctx, &client_id, request.request_id, request.command).await;
                if let Err(e) = ctx.ipc.send_response(&client_id, response).await {
                    debug!(client_id = %client_id, error = %e, "Client gone before response");
                }
            });
        }

        ServerMessage::ClientConnected { client_id, info } => {
            info!(
                client_id = %client_id,
                role = ?info.role,
                uid = ?info.uid,
                "Client connected"
            );

            store
                .audit(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    role: format!("{:?}", info.role),
                    uid: info.uid,
                })
                .await;
        }

        ServerMessage::ClientDisconnected { client_id } => {
            debug!(client_id = %client_id, "Client disconnected");

            store
                .audit(AuditEventType::ClientDisconnected {
                    client_id: client_id.to_string(),
                })
                .await;

            rate_limiter.remove(&client_id);
        }
    }
}

async fn handle_command(
    ctx: &Shared,
    client_id: &ClientId,
    request_id: u64,
    command: Command,
) -> Response {
    if command.requires_admin() {
        let allowed = ctx
            .ipc
            .get_client_info(client_id)
            .await
            .is_some_and(|info| info.role.can_run_jobs());
        if !allowed {
            return Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
            );
        }
    }

    let engine = &ctx.engine;
    let result = match command {
        Command::CreateHabit { user_id, habit } => engine
            .create_habit(&user_id, habit)
            .await
            .map(ResponsePayload::HabitCreated),

        Command::ListHabits { user_id } => engine
            .list_habits(&user_id)
            .await
            .map(|habits| ResponsePayload::Habits { habits }),

        Command::UpdateProgress {
            user_id,
            habit_id,
            delta,
        } => engine
            .apply_delta(habit_id, &user_id, delta)
            .await
            .map(ResponsePayload::HabitUpdated),

        Command::ArchiveHabit { user_id, habit_id } => {
            let archived = engine.archive(habit_id, &user_id).await;
            if archived.is_ok() {
                ctx.ipc.broadcast_event(Event::new(EventPayload::HabitArchived {
                    habit_id,
                    user_id,
                }));
            }
            archived.map(ResponsePayload::HabitArchived)
        }

        Command::ListPastHabits { user_id } => engine
            .list_past_habits(&user_id)
            .await
            .map(|past_habits| ResponsePayload::PastHabits { past_habits }),

        Command::DueReminders { user_id } => {
            let reminders = ctx
                .scanner
                .due_reminders(ctx.clock.now(), Some(&user_id))
                .await;
            Ok(ResponsePayload::Reminders { reminders })
        }

        Command::UserStats { user_id } => engine
            .user_stats(&user_id)
            .await
            .map(ResponsePayload::UserStats),

        Command::CollectBadge { user_id, badge_id } => engine
            .collect_badge(&user_id, &badge_id)
            .await
            .map(|_| ResponsePayload::BadgeCollected),

        Command::Leaderboard { limit } => engine
            .leaderboard(limit)
            .await
            .map(|entries| ResponsePayload::Leaderboard { entries }),

        Command::GetHealth => {
            let store_healthy = engine.store().is_healthy().await;
            Ok(ResponsePayload::Health(HealthStatus {
                live: true,
                ready: store_healthy,
                store_healthy,
                scheduler: ctx.scheduler.status(),
            }))
        }

        Command::SubscribeEvents => Ok(ResponsePayload::Subscribed {
            client_id: client_id.clone(),
        }),

        Command::UnsubscribeEvents => Ok(ResponsePayload::Unsubscribed),

        Command::RunRecurrence => Ok(match ctx.scheduler.run_recurrence_now().await {
            Some(outcomes) => ResponsePayload::RecurrenceRan { outcomes },
            None => ResponsePayload::JobBusy,
        }),

        Command::ScanReminders => Ok(match ctx.scheduler.scan_reminders_now().await {
            Some(reminders) => ResponsePayload::Reminders { reminders },
            None => ResponsePayload::JobBusy,
        }),

        Command::Ping => Ok(ResponsePayload::Pong),
    };

    match result {
        Ok(payload) => Response::success(request_id, payload),
        Err(e) => {
            debug!(request_id, error = %e, "Request failed");
            Response::error(request_id, ErrorInfo::from(&e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "habitlinkd starting");

    let service = Service::new(&args).await?;
    service.run().await
}
