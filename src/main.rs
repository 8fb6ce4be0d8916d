//! # studysms: SMS outreach for the Narratives Project
//!
//! Keeps the participant list in SQLite and texts each participant on the
//! schedule's offset days.
//!
//! Usage:
//!   studysms distribute                 # Send today's texts (cron this daily)
//!   studysms distribute --dry-run       # Log what would be sent
//!   studysms preview --date 06/01/2022  # Show the plan for a day
//!   studysms import participants.csv    # Bulk import
//!   studysms serve                      # Staff dashboard + inbound webhook

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use studysms_channels::{DryRunTransport, TwilioTransport};
use studysms_core::types::{format_date, parse_date};
use studysms_core::{NewParticipant, SmsTransport, StudySmsConfig};
use studysms_scheduler::{LogEntry, ParticipantDb, RunGuard, dispatch, import};

#[derive(Parser)]
#[command(
    name = "studysms",
    version,
    about = "📱 studysms: scheduled SMS reminders for study participants"
)]
struct Cli {
    /// Config file (default: $STUDYSMS_CONFIG or ~/.studysms/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Participant database (overrides [database].path)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the staff web server and inbound SMS webhook
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
    },
    /// Send every text due today and stamp the ones that went out
    Distribute {
        /// Treat this day as today (MM/DD/YYYY)
        #[arg(long)]
        date: Option<String>,
        /// Log messages instead of sending them; nothing is stamped
        #[arg(long)]
        dry_run: bool,
    },
    /// Show what distribute would send, without sending or stamping
    Preview {
        #[arg(long)]
        date: Option<String>,
    },
    /// Bulk import participants from .csv, .tsv, .txt or .xlsx
    Import { file: PathBuf },
    /// Add one participant
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        /// Study date (MM/DD/YYYY)
        #[arg(long)]
        date: String,
    },
    /// Stop texting a participant (or resume with --undo)
    Ignore {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        undo: bool,
    },
    /// Correct a participant's phone number
    ChangeNumber {
        #[arg(long)]
        name: String,
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
    },
    /// List participants
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Send a one-off text to check the Twilio setup
    TestSms {
        phone: String,
        #[arg(long)]
        body: Option<String>,
    },
    /// Delete every participant
    Reset {
        /// Required: confirms the reset
        #[arg(long)]
        yes: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<StudySmsConfig> {
    let mut config = match &cli.config {
        Some(path) => StudySmsConfig::load_from(&expand_path(path))?,
        None => StudySmsConfig::load()?,
    };
    config.apply_env_overrides();
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    Ok(config)
}

fn open_db(config: &StudySmsConfig) -> Result<ParticipantDb> {
    let path = config.database.resolved_path();
    tracing::debug!("Opening participant DB at {}", path.display());
    Ok(ParticipantDb::open(&path)?)
}

fn twilio(config: &StudySmsConfig) -> Result<TwilioTransport> {
    Ok(TwilioTransport::new(config.twilio.clone())?)
}

fn resolve_day(config: &StudySmsConfig, date: Option<&str>) -> Result<chrono::NaiveDate> {
    Ok(match date {
        Some(raw) => parse_date(raw)?,
        None => config.schedule.today()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "studysms=debug,studysms_scheduler=debug,studysms_channels=debug,studysms_gateway=debug,tower_http=debug"
    } else {
        "studysms=info,studysms_scheduler=info,studysms_channels=info,studysms_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Command::Serve { port, host } => {
            let mut config = config;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            let db = Arc::new(open_db(&config)?);
            let transport: Option<Arc<dyn SmsTransport>> = if config.twilio.is_configured() {
                Some(Arc::new(twilio(&config)?))
            } else {
                None
            };
            let state = studysms_gateway::AppState::new(config, db, transport);
            studysms_gateway::start(state).await?;
        }

        Command::Distribute { date, dry_run } => {
            let today = resolve_day(&config, date.as_deref())?;
            let _guard = RunGuard::acquire(
                &config.database.lock_path(),
                Duration::from_secs(config.schedule.stale_lock_secs),
            )?;
            let db = open_db(&config)?;
            let transport: Box<dyn SmsTransport> = if dry_run {
                Box::new(DryRunTransport::new(config.twilio.from_number.clone()))
            } else {
                Box::new(twilio(&config)?)
            };

            let report = if dry_run {
                dispatch::rehearse(&db, transport.as_ref(), today).await?
            } else {
                dispatch::run(&db, transport.as_ref(), today).await?
            };
            println!(
                "📤 {}: {} sent, {} failed, {} ignored, {} already sent",
                format_date(report.date),
                report.sent_count(),
                report.failures.len(),
                report.ignored,
                report.already_sent
            );
            for sent in &report.sent {
                println!("   ✅ {:<9} {} ({})", sent.stage, sent.name, sent.phone_number);
            }
            for failure in &report.failures {
                println!(
                    "   ❌ {:<9} {} ({}): {}",
                    failure.stage, failure.name, failure.phone_number, failure.error
                );
            }
            for key in &report.duplicate_keys {
                println!("   ⚠️  duplicate rows: {key}");
            }
            for row in &report.unreadable {
                println!("   ⚠️  skipped row #{} {} ({}): {}", row.id, row.name, row.phone_number, row.error);
            }
            if !report.is_clean() {
                bail!(
                    "{} message(s) failed, {} row(s) unreadable",
                    report.failures.len(),
                    report.unreadable.len()
                );
            }
        }

        Command::Preview { date } => {
            let today = resolve_day(&config, date.as_deref())?;
            let db = open_db(&config)?;
            let planned = dispatch::plan(&db.get_all()?, today);
            println!("📋 {} text(s) due on {}", planned.len(), format_date(today));
            for send in &planned {
                println!("\n── {} → {} ({})\n{}", send.stage, send.name, send.phone_number, send.body);
            }
        }

        Command::Import { file } => {
            let db = open_db(&config)?;
            let summary = import::import_file(&db, &file)?;
            println!(
                "📥 Imported {} participant(s) from {} ({} incomplete row(s) skipped)",
                summary.inserted,
                display(&file),
                summary.skipped
            );
        }

        Command::Add { name, phone, date } => {
            let db = open_db(&config)?;
            let participant = NewParticipant::parse(&name, &phone, &date)?;
            let id = db.insert(&participant)?;
            println!(
                "➕ Added #{id}: {} ({}), study date {}",
                participant.name,
                participant.phone_number,
                format_date(participant.date_of_study)
            );
        }

        Command::Ignore { name, phone, undo } => {
            let db = open_db(&config)?;
            let outcome = db.set_ignore(&name, &phone, !undo)?;
            let verb = if undo { "Resumed" } else { "Ignoring" };
            println!("{verb} {name} ({} row(s))", outcome.updated);
        }

        Command::ChangeNumber { name, old, new } => {
            let db = open_db(&config)?;
            let outcome = db.update_phone(&name, &old, &new)?;
            println!("📞 Updated {} row(s) for {name}", outcome.updated);
        }

        Command::List { json } => {
            let db = open_db(&config)?;
            let participants = db.get_all()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&participants)?);
            } else {
                println!("{:<5} {:<28} {:<12} {:<11} {:<7} last stage", "id", "name", "phone", "study date", "ignore");
                for p in &participants {
                    let last = p
                        .stamps
                        .iter()
                        .next_back()
                        .map(|(stage, date)| format!("{stage} ({})", format_date(*date)))
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "{:<5} {:<28} {:<12} {:<11} {:<7} {}",
                        p.id,
                        p.name,
                        p.phone_number,
                        format_date(p.date_of_study),
                        p.ignore,
                        last
                    );
                }
                println!("{} participant(s)", participants.len());
            }
        }

        Command::TestSms { phone, body } => {
            let db = open_db(&config)?;
            let transport = twilio(&config)?;
            let to = studysms_core::types::normalize_phone(&phone)?;
            let body = body.unwrap_or_else(|| "This is a test message from the Narratives Project.".into());
            match transport.send(&to, transport.from_number(), &body).await {
                Ok(receipt) => {
                    db.log_message(&LogEntry::sent(&to, &body, None, &receipt.sid))?;
                    println!("✅ Sent test text to {to} [{}]", receipt.sid);
                }
                Err(e) => {
                    let error = e.to_string();
                    db.log_message(&LogEntry::failed(&to, &body, None, &error))?;
                    bail!("Test text failed: {error}");
                }
            }
        }

        Command::Reset { yes } => {
            if !yes {
                bail!("Refusing to delete every participant without --yes");
            }
            let db = open_db(&config)?;
            let deleted = db.reset()?;
            println!("🗑️  Deleted {deleted} participant(s)");
        }
    }

    Ok(())
}

fn display(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["studysms", "distribute", "--date", "06/01/2022", "--dry-run"]).unwrap();
        match cli.command {
            Command::Distribute { date, dry_run } => {
                assert_eq!(date.as_deref(), Some("06/01/2022"));
                assert!(dry_run);
            }
            _ => panic!("expected distribute"),
        }

        let cli = Cli::try_parse_from(["studysms", "-v", "ignore", "--name", "Ian Ferguson", "--phone", "6502235997", "--undo"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Ignore { undo: true, .. }));

        assert!(Cli::try_parse_from(["studysms", "reset"]).is_ok());
        assert!(Cli::try_parse_from(["studysms", "bogus"]).is_err());
    }

    #[test]
    fn test_load_config_applies_db_flag() {
        let dir = std::env::temp_dir().join("studysms-cli-config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[database]\npath = \"/tmp/study.db\"\n\n[gateway]\nport = 8088\n").unwrap();
        let path = path.to_string_lossy().to_string();

        let cli = Cli::try_parse_from(["studysms", "--config", &path, "list"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.database.resolved_path(), PathBuf::from("/tmp/study.db"));
        assert_eq!(config.gateway.port, 8088);

        let cli = Cli::try_parse_from(["studysms", "--config", &path, "--db", "/tmp/other.db", "list"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.database.resolved_path(), PathBuf::from("/tmp/other.db"));
        assert_eq!(config.gateway.port, 8088);

        let missing =
            Cli::try_parse_from(["studysms", "--config", "/nonexistent/studysms.toml", "list"]).unwrap();
        assert!(load_config(&missing).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
