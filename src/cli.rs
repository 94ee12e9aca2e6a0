//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::config_validation::{database_path, load_trading_config};
use crate::domain::error::SigtraderError;
use crate::domain::pipeline::PipelineResult;

#[derive(Parser, Debug)]
#[command(name = "sigtrader", about = "Signal-driven automated trading agent")]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database tables
    InitDb {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Import bars from CSV files named <SYMBOL>_<TIMEFRAME>.csv
    Import {
        #[arg(short, long)]
        config: PathBuf,
        /// A single CSV file (requires --symbol)
        #[arg(long)]
        file: Option<PathBuf>,
        /// Directory of CSV files
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        symbol: Option<String>,
        /// Defaults to [pipeline] timeframe
        #[arg(long)]
        timeframe: Option<String>,
    },
    /// Run the trading loop against the paper broker
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Read bars from the database but keep trades, signals and account
        /// snapshots in memory
        #[arg(long)]
        dry_run: bool,
    },
    /// List recorded trades
    Trades {
        #[arg(short, long)]
        config: PathBuf,
        /// open or closed
        #[arg(long)]
        status: Option<String>,
    },
    /// Show recent account snapshots
    Account {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show recent signal snapshots for a symbol
    Signals {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::InitDb { config } => run_init_db(&config),
        Command::Import {
            config,
            file,
            dir,
            symbol,
            timeframe,
        } => run_import(
            &config,
            file.as_deref(),
            dir.as_deref(),
            symbol.as_deref(),
            timeframe.as_deref(),
        ),
        Command::Run {
            config,
            once,
            dry_run,
        } => run_trading(&config, once, dry_run),
        Command::Trades { config, status } => run_trades(&config, status.as_deref()),
        Command::Account { config, limit } => run_account(&config, limit),
        Command::Signals {
            config,
            symbol,
            limit,
        } => run_signals(&config, &symbol, limit),
        Command::Validate { config } => run_validate(&config),
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| fail(&e))
}

fn fail(err: &SigtraderError) -> ExitCode {
    eprintln!("error: {err}");
    ExitCode::from(err)
}

pub fn format_result(r: &PipelineResult) -> String {
    let mut line = format!(
        "{}\t{}\tscore={:+.2}\tconf={:.2}\t{}",
        r.symbol, r.snapshot.bias, r.snapshot.score, r.snapshot.confidence, r.action
    );
    if let Some(trade) = &r.trade {
        line.push_str(&format!(
            "\ttrade={} {} qty={} entry={:.4}",
            trade.id(),
            trade.side(),
            trade.quantity(),
            trade.entry_price()
        ));
        if let Some(pnl) = trade.pnl() {
            line.push_str(&format!(" pnl={pnl:.2}"));
        }
    }
    if let Some(failure) = &r.failure {
        line.push_str(&format!("\tfailed: {failure}"));
    }
    line
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Validating config: {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let trading = match load_trading_config(&adapter) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    if let Err(e) = database_path(&adapter) {
        return fail(&e);
    }

    let symbols = if trading.pipeline.symbols.is_empty() {
        "<all with bars>".to_string()
    } else {
        trading.pipeline.symbols.join(",")
    };
    eprintln!("  symbols:   {symbols}");
    eprintln!("  timeframe: {}", trading.pipeline.timeframe);
    eprintln!("  capital:   {:.2}", trading.initial_capital);
    eprintln!(
        "  risk:      {:.2}% of equity, stop {:.2}%, reward/risk {:.2}",
        trading.risk.risk_fraction * 100.0,
        trading.risk.stop_loss_pct,
        trading.risk.reward_risk
    );
    eprintln!("\nConfiguration is valid.");
    ExitCode::SUCCESS
}

#[cfg(feature = "sqlite")]
mod store_commands {
    use super::*;
    use crate::adapters::csv_adapter::{CsvAdapter, read_bars};
    use crate::adapters::memory_store::MemoryStore;
    use crate::adapters::paper_broker::PaperBroker;
    use crate::adapters::sqlite_adapter::SqliteAdapter;
    use crate::domain::config_validation::build_pipeline_config;
    use crate::domain::ledger::AccountLedger;
    use crate::domain::pipeline::{Pipeline, PipelinePorts, TradingConfig};
    use crate::domain::tracker::PositionTracker;
    use crate::domain::trade::TradeStatus;
    use crate::ports::bar_store::BarStore;
    use crate::ports::config_port::ConfigPort;
    use crate::ports::persistence::{AccountStore, SignalStore, TradeStore};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::watch;
    use tracing::{info, warn};

    fn finish(result: Result<(), SigtraderError>) -> ExitCode {
        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => fail(&e),
        }
    }

    pub fn open_store(config: &dyn ConfigPort) -> Result<Arc<SqliteAdapter>, SigtraderError> {
        let store = SqliteAdapter::from_config(config)?;
        store.initialize_schema()?;
        Ok(Arc::new(store))
    }

    fn with_store(
        config_path: &Path,
        f: impl FnOnce(&FileConfigAdapter, Arc<SqliteAdapter>) -> Result<(), SigtraderError>,
    ) -> ExitCode {
        let adapter = match load_config(config_path) {
            Ok(a) => a,
            Err(code) => return code,
        };
        let store = match open_store(&adapter) {
            Ok(s) => s,
            Err(e) => return fail(&e),
        };
        finish(f(&adapter, store))
    }

    pub fn run_init_db(config_path: &Path) -> ExitCode {
        with_store(config_path, |adapter, _| {
            eprintln!("Schema ready at {}", database_path(adapter)?);
            Ok(())
        })
    }

    pub fn run_import(
        config_path: &Path,
        file: Option<&Path>,
        dir: Option<&Path>,
        symbol: Option<&str>,
        timeframe: Option<&str>,
    ) -> ExitCode {
        with_store(config_path, |adapter, store| {
            let timeframe = match timeframe {
                Some(tf) => tf.to_string(),
                None => build_pipeline_config(adapter)?.timeframe,
            };

            let mut batches = Vec::new();
            match (file, dir) {
                (Some(file), _) => {
                    let symbol = symbol.ok_or_else(|| SigtraderError::InvalidData {
                        reason: "--symbol is required with --file".into(),
                    })?;
                    batches.push((symbol.to_string(), read_bars(file, symbol, &timeframe)?));
                }
                (None, Some(dir)) => {
                    let csv = CsvAdapter::new(dir.to_path_buf());
                    for symbol in csv.list_symbols(&timeframe)? {
                        let bars = csv.fetch_bars(&symbol, &timeframe)?;
                        batches.push((symbol, bars));
                    }
                }
                (None, None) => {
                    return Err(SigtraderError::InvalidData {
                        reason: "one of --file or --dir is required".into(),
                    });
                }
            }

            for (symbol, bars) in batches {
                let inserted = store.append(&bars)?;
                eprintln!(
                    "{symbol} [{timeframe}]: {inserted} new of {} bars",
                    bars.len()
                );
            }
            Ok(())
        })
    }

    pub fn run_trades(config_path: &Path, status: Option<&str>) -> ExitCode {
        with_store(config_path, |_, store| {
            let status = status.map(str::parse::<TradeStatus>).transpose()?;
            let trades = store.trades(status)?;
            for t in &trades {
                println!(
                    "{}\t{}\t{}\t{}\tqty={}\tentry={:.4}\tsl={:.4}\ttp={:.4}\texit={}\tpnl={}\tr={}",
                    t.id(),
                    t.symbol(),
                    t.side(),
                    t.status().as_str(),
                    t.quantity(),
                    t.entry_price(),
                    t.stop_loss(),
                    t.take_profit(),
                    t.exit_price().map_or("-".to_string(), |p| format!("{p:.4}")),
                    t.pnl().map_or("-".to_string(), |p| format!("{p:.2}")),
                    t.r_multiple().map_or("-".to_string(), |r| format!("{r:.2}")),
                );
            }
            eprintln!("{} trades", trades.len());
            Ok(())
        })
    }

    pub fn run_account(config_path: &Path, limit: usize) -> ExitCode {
        with_store(config_path, |_, store| {
            let snapshots = store.snapshots(limit)?;
            if snapshots.is_empty() {
                eprintln!("No account snapshots recorded");
            }
            for s in &snapshots {
                println!(
                    "{}\tcash={:.2}\tequity={:.2}\tday_pnl={:.2}\ttotal_pnl={:.2}",
                    s.timestamp.to_rfc3339(),
                    s.cash,
                    s.equity,
                    s.day_pnl,
                    s.total_pnl
                );
            }
            Ok(())
        })
    }

    pub fn run_signals(config_path: &Path, symbol: &str, limit: usize) -> ExitCode {
        with_store(config_path, |_, store| {
            for s in store.recent_signals(symbol, limit)? {
                println!(
                    "{}\t{}\tscore={:+.2}\tconf={:.2}\ttrade={}",
                    s.timestamp.to_rfc3339(),
                    s.bias,
                    s.score,
                    s.confidence,
                    s.should_trade
                );
            }
            Ok(())
        })
    }

    pub fn run_trading(config_path: &Path, once: bool, dry_run: bool) -> ExitCode {
        with_store(config_path, |adapter, store| {
            let trading = load_trading_config(adapter)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(trade_with_paper_broker(store, trading, once, dry_run))
        })
    }

    type Books = (
        Arc<PositionTracker>,
        Arc<AccountLedger>,
        Arc<dyn SignalStore + Send + Sync>,
    );

    /// Tracker, ledger and signal sink for a run. A dry run starts from an
    /// empty in-memory book and leaves the database untouched.
    fn open_books(store: &Arc<SqliteAdapter>, capital: f64, dry_run: bool) -> Result<Books, SigtraderError> {
        if dry_run {
            info!("dry run, trades and snapshots are not persisted");
            let scratch = Arc::new(MemoryStore::new());
            let tracker = Arc::new(PositionTracker::load(scratch.clone())?);
            let ledger = Arc::new(AccountLedger::new(scratch.clone(), capital));
            return Ok((tracker, ledger, scratch));
        }

        let tracker = Arc::new(PositionTracker::load(store.clone())?);
        let closed = store.trades(Some(TradeStatus::Closed))?;
        let ledger = Arc::new(AccountLedger::resume(store.clone(), capital, &closed)?);
        Ok((tracker, ledger, store.clone()))
    }

    async fn trade_with_paper_broker(
        store: Arc<SqliteAdapter>,
        config: TradingConfig,
        once: bool,
        dry_run: bool,
    ) -> Result<(), SigtraderError> {
        let (tracker, ledger, signals) = open_books(&store, config.initial_capital, dry_run)?;

        // Paper positions don't survive a restart; re-adopt what the store holds.
        let broker = Arc::new(PaperBroker::new());
        for trade in tracker.open_trades() {
            broker.adopt(&trade);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = Arc::new(Pipeline::new(
            PipelinePorts {
                bars: store,
                signals,
                broker,
                tracker,
                ledger,
            },
            &config,
            shutdown_rx,
        ));

        let report = pipeline.reconcile().await?;
        info!(clean = report.is_clean(), open = pipeline.tracker().open_count(), "startup reconciliation");

        if once {
            let symbols = pipeline.resolve_symbols()?;
            for result in pipeline.run_cycle(&symbols, Utc::now()).await {
                println!("{}", format_result(&result));
            }
            return Ok(());
        }

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    let _ = shutdown_tx.send(true);
                }
                Err(e) => {
                    warn!(error = %e, "ctrl-c handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        });

        pipeline.run().await?;
        for result in pipeline.latest_results() {
            println!("{}", format_result(&result));
        }
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub use store_commands::open_store;
#[cfg(feature = "sqlite")]
use store_commands::{run_account, run_import, run_init_db, run_signals, run_trades, run_trading};

#[cfg(not(feature = "sqlite"))]
fn sqlite_required(command: &str) -> ExitCode {
    eprintln!("error: sqlite feature is required for {command}");
    ExitCode::from(1)
}

#[cfg(not(feature = "sqlite"))]
fn run_init_db(_: &Path) -> ExitCode {
    sqlite_required("init-db")
}

#[cfg(not(feature = "sqlite"))]
fn run_import(_: &Path, _: Option<&Path>, _: Option<&Path>, _: Option<&str>, _: Option<&str>) -> ExitCode {
    sqlite_required("import")
}

#[cfg(not(feature = "sqlite"))]
fn run_trading(_: &Path, _: bool, _: bool) -> ExitCode {
    sqlite_required("run")
}

#[cfg(not(feature = "sqlite"))]
fn run_trades(_: &Path, _: Option<&str>) -> ExitCode {
    sqlite_required("trades")
}

#[cfg(not(feature = "sqlite"))]
fn run_account(_: &Path, _: usize) -> ExitCode {
    sqlite_required("account")
}

#[cfg(not(feature = "sqlite"))]
fn run_signals(_: &Path, _: &str, _: usize) -> ExitCode {
    sqlite_required("signals")
}
