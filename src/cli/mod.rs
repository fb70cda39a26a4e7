use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::application::{HistoryQuery, LedgerEngine, QrRedemption};
use crate::config::LedgerConfig;
use crate::domain::{Actor, Balance, HistoryFilter, LedgerTransaction, Role, SpendTarget};
use crate::io::Exporter;

/// Fleet Ledger - prepaid service rights for vehicle fleets
#[derive(Parser)]
#[command(name = "fleet-ledger")]
#[command(about = "Rights and credit ledger for fleet services")]
#[command(version)]
pub struct Cli {
    /// Database file path (overrides FLEET_LEDGER_DB and the config file)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Identifier of the caller, as verified upstream
    #[arg(long, global = true, default_value = "cli")]
    pub actor: String,

    /// Role of the caller: company_admin, service_center_operator, driver, system
    #[arg(long, global = true, default_value = "system")]
    pub role: String,

    /// Company the caller belongs to (required for company_admin and driver)
    #[arg(long, global = true)]
    pub company: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// List the service types rights can be allocated for
    Catalog,

    /// Vehicle management commands
    #[command(subcommand)]
    Vehicle(VehicleCommands),

    /// Service center directory commands
    #[command(subcommand)]
    Center(CenterCommands),

    /// Allocate generic credits, or rights with --service-type
    Allocate {
        /// Vehicle ID
        vehicle: String,

        /// Number of credits or rights
        amount: i64,

        /// Service type for a right allocation (omit for generic credits)
        #[arg(short, long)]
        service_type: Option<String>,

        /// Idempotency key; a retry with the same key is not applied twice
        #[arg(short, long)]
        key: Option<String>,

        /// Description shown in the history
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Spend generic credits, or rights with --service-type
    Spend {
        /// Vehicle ID
        vehicle: String,

        /// Number of credits or rights
        amount: i64,

        /// Service center where the service was rendered
        #[arg(long)]
        center: String,

        /// Service type for a right spend (omit for generic credits)
        #[arg(short, long)]
        service_type: Option<String>,

        /// Idempotency key; a retry with the same key is not applied twice
        #[arg(short, long)]
        key: Option<String>,

        /// Description shown in the history
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Show balances of a vehicle
    Balance {
        /// Vehicle ID
        vehicle: String,

        /// Show the balance as of this date (YYYY-MM-DD, end of day)
        #[arg(long)]
        at: Option<String>,
    },

    /// List a vehicle's transactions, newest first
    History {
        /// Vehicle ID
        vehicle: String,

        /// all, allocation or usage
        #[arg(long, default_value = "all")]
        filter: String,

        /// Filter from date (YYYY-MM-DD)
        #[arg(long)]
        from_date: Option<String>,

        /// Filter to date (YYYY-MM-DD)
        #[arg(long)]
        to_date: Option<String>,

        /// Maximum number of transactions to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// QR token commands
    #[command(subcommand)]
    Token(TokenCommands),

    /// Reconcile cached balances against the transaction log
    Check,

    /// Export a vehicle's history (csv) or full account (json)
    Export {
        /// Vehicle ID
        vehicle: String,

        /// Output format: csv, json
        #[arg(long, default_value = "csv")]
        format: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum VehicleCommands {
    /// Register a vehicle to a company
    Register {
        /// Plate number or other label
        label: String,

        /// Owning company ID (defaults to --company)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Deactivate a vehicle (balances are kept)
    Deactivate {
        /// Vehicle ID
        id: String,
    },

    /// Show vehicle details and balances
    Show {
        /// Vehicle ID
        id: String,
    },

    /// List vehicles
    List {
        /// Only vehicles of this company
        #[arg(long)]
        owner: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum CenterCommands {
    /// Register a service center
    Register {
        /// Service center ID
        id: String,

        /// Display name
        name: String,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a single-use QR token
    Issue {
        /// Vehicle ID
        vehicle: String,

        /// Number of credits or rights the token spends
        amount: i64,

        /// Service type (omit for generic credits)
        #[arg(short, long)]
        service_type: Option<String>,

        /// Lifetime in minutes (defaults to the configured ttl)
        #[arg(long)]
        ttl_minutes: Option<i64>,
    },

    /// Redeem a token at a service center
    Redeem {
        /// Token value
        token: String,

        /// Service center redeeming the token
        #[arg(long)]
        center: String,
    },

    /// Show a token and its state
    Show {
        /// Token value
        token: String,
    },
}

impl Cli {
    fn config(&self) -> Result<LedgerConfig> {
        let config = LedgerConfig::load().context("Failed to load configuration")?;
        Ok(match &self.database {
            Some(path) => config.with_database_path(path.clone()),
            None => config,
        })
    }

    fn caller(&self) -> Result<Actor> {
        let role = Role::from_str(&self.role)
            .with_context(|| format!("Unknown role '{}'", self.role))?;
        let mut actor = Actor::new(self.actor.clone(), role);
        if let Some(company) = &self.company {
            actor = actor.with_company(parse_id(company).context("Invalid company ID")?);
        }
        Ok(actor)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config()?;
        let actor = self.caller()?;

        if let Commands::Init = self.command {
            LedgerEngine::init(config.clone()).await?;
            println!("Database initialized: {}", config.database_path);
            return Ok(());
        }

        let engine = LedgerEngine::connect(config).await?;

        match self.command {
            Commands::Init => {}

            Commands::Catalog => {
                println!("{:<24} {:<12} LABEL", "SERVICE TYPE", "CATEGORY");
                println!("{}", "-".repeat(60));
                for entry in engine.catalog().iter() {
                    println!("{:<24} {:<12} {}", entry.id, entry.category, entry.label);
                }
            }

            Commands::Vehicle(cmd) => run_vehicle_command(&engine, &actor, cmd).await?,

            Commands::Center(CenterCommands::Register { id, name }) => {
                engine.register_service_center(&actor, &id, &name).await?;
                println!("Registered service center: {} ({})", name, id);
            }

            Commands::Allocate {
                vehicle,
                amount,
                service_type,
                key,
                description,
            } => {
                let vehicle_id = parse_id(&vehicle).context("Invalid vehicle ID")?;
                let key = key.unwrap_or_else(|| Uuid::new_v4().to_string());
                let tx = match service_type {
                    Some(service_type) => {
                        engine
                            .allocate_right(
                                &actor,
                                vehicle_id,
                                &service_type,
                                amount,
                                &key,
                                description,
                            )
                            .await?
                    }
                    None => {
                        engine
                            .allocate_generic(&actor, vehicle_id, amount, &key, description)
                            .await?
                    }
                };
                println!("Recorded: {} ({})", tx.description, tx.id);
            }

            Commands::Spend {
                vehicle,
                amount,
                center,
                service_type,
                key,
                description,
            } => {
                let vehicle_id = parse_id(&vehicle).context("Invalid vehicle ID")?;
                let key = key.unwrap_or_else(|| Uuid::new_v4().to_string());
                let tx = match service_type {
                    Some(service_type) => {
                        engine
                            .spend_right(
                                &actor,
                                vehicle_id,
                                &service_type,
                                amount,
                                &center,
                                &key,
                                description,
                            )
                            .await?
                    }
                    None => {
                        engine
                            .spend_generic(&actor, vehicle_id, amount, &center, &key, description)
                            .await?
                    }
                };
                println!("Recorded: {} ({})", tx.description, tx.id);
            }

            Commands::Balance { vehicle, at } => {
                let vehicle_id = parse_id(&vehicle).context("Invalid vehicle ID")?;
                let balance = match at {
                    Some(date) => {
                        let at = parse_end_of_day(&date)
                            .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD", date))?;
                        engine.balance_at(&actor, vehicle_id, at).await?
                    }
                    None => engine.current_balance(&actor, vehicle_id).await?,
                };
                print_balance(&balance);
            }

            Commands::History {
                vehicle,
                filter,
                from_date,
                to_date,
                limit,
            } => {
                let vehicle_id = parse_id(&vehicle).context("Invalid vehicle ID")?;
                let query = HistoryQuery {
                    filter: HistoryFilter::from_str(&filter)
                        .with_context(|| format!("Unknown filter '{}'", filter))?,
                    from_date: from_date
                        .map(|s| parse_date(&s))
                        .transpose()
                        .context("Invalid from-date")?,
                    to_date: to_date
                        .map(|s| parse_end_of_day(&s))
                        .transpose()
                        .context("Invalid to-date")?,
                    limit,
                };
                let transactions = engine.history_query(&actor, vehicle_id, query).await?;
                print_history(&transactions);
            }

            Commands::Token(cmd) => run_token_command(&engine, &actor, cmd).await?,

            Commands::Check => run_check_command(&engine, &actor).await?,

            Commands::Export {
                vehicle,
                format,
                output,
            } => {
                let vehicle_id = parse_id(&vehicle).context("Invalid vehicle ID")?;
                let writer: Box<dyn std::io::Write> = match &output {
                    Some(path) => Box::new(
                        std::fs::File::create(path)
                            .with_context(|| format!("Failed to create {}", path))?,
                    ),
                    None => Box::new(std::io::stdout()),
                };
                let exporter = Exporter::new(&engine);

                match format.as_str() {
                    "csv" => {
                        let count = exporter
                            .export_history_csv(&actor, vehicle_id, HistoryQuery::default(), writer)
                            .await?;
                        if output.is_some() {
                            println!("Exported {} transactions", count);
                        }
                    }
                    "json" => {
                        let snapshot = exporter
                            .export_account_json(&actor, vehicle_id, writer)
                            .await?;
                        if output.is_some() {
                            println!("Exported {} transactions", snapshot.transactions.len());
                        }
                    }
                    other => anyhow::bail!("Unknown format '{}'. Use csv or json", other),
                }
            }
        }

        Ok(())
    }
}

async fn run_vehicle_command(engine: &LedgerEngine, actor: &Actor, cmd: VehicleCommands) -> Result<()> {
    match cmd {
        VehicleCommands::Register { label, owner } => {
            let company_id = match owner {
                Some(owner) => parse_id(&owner).context("Invalid company ID")?,
                None => actor
                    .company_id
                    .context("Specify --owner or --company for the owning company")?,
            };
            let vehicle = engine.register_vehicle(actor, company_id, label).await?;
            println!("Registered vehicle: {} ({})", vehicle.label, vehicle.id);
        }
        VehicleCommands::Deactivate { id } => {
            let vehicle_id = parse_id(&id).context("Invalid vehicle ID")?;
            let vehicle = engine.deactivate_vehicle(actor, vehicle_id).await?;
            println!("Deactivated vehicle: {} ({})", vehicle.label, vehicle.id);
        }
        VehicleCommands::Show { id } => {
            let vehicle_id = parse_id(&id).context("Invalid vehicle ID")?;
            let vehicle = engine.get_vehicle(actor, vehicle_id).await?;
            let balance = engine.current_balance(actor, vehicle_id).await?;

            println!("Vehicle:     {}", vehicle.label);
            println!("ID:          {}", vehicle.id);
            println!("Company:     {}", vehicle.company_id);
            println!("Registered:  {}", vehicle.created_at.format("%Y-%m-%d %H:%M"));
            match vehicle.deactivated_at {
                Some(at) => println!("Status:      deactivated {}", at.format("%Y-%m-%d")),
                None => println!("Status:      active"),
            }
            println!();
            print_balance(&balance);
        }
        VehicleCommands::List { owner } => {
            let company_id = owner
                .map(|s| parse_id(&s))
                .transpose()
                .context("Invalid company ID")?;
            let vehicles = engine.list_vehicles(actor, company_id).await?;
            if vehicles.is_empty() {
                println!("No vehicles found.");
            } else {
                println!("{:<16} {:<38} STATUS", "LABEL", "ID");
                println!("{}", "-".repeat(64));
                for vehicle in vehicles {
                    let status = if vehicle.is_active() { "active" } else { "deactivated" };
                    println!("{:<16} {:<38} {}", truncate(&vehicle.label, 16), vehicle.id, status);
                }
            }
        }
    }
    Ok(())
}

async fn run_token_command(engine: &LedgerEngine, actor: &Actor, cmd: TokenCommands) -> Result<()> {
    let flow = QrRedemption::new(engine);

    match cmd {
        TokenCommands::Issue {
            vehicle,
            amount,
            service_type,
            ttl_minutes,
        } => {
            let vehicle_id = parse_id(&vehicle).context("Invalid vehicle ID")?;
            let target = match service_type {
                Some(service_type) => SpendTarget::Right(service_type),
                None => SpendTarget::Generic,
            };
            let ttl = ttl_minutes
                .map(|minutes| {
                    chrono::Duration::try_minutes(minutes)
                        .with_context(|| format!("Token lifetime of {} minutes is too large", minutes))
                })
                .transpose()?;
            let token = flow.issue(actor, vehicle_id, target, amount, ttl).await?;
            println!("Token:   {}", token.token);
            println!("Expires: {}", token.expires_at.format("%Y-%m-%d %H:%M:%S"));
        }
        TokenCommands::Redeem { token, center } => {
            let tx = flow.redeem(actor, &token, &center).await?;
            println!("Redeemed: {} ({})", tx.description, tx.id);
        }
        TokenCommands::Show { token } => {
            let qr = flow.get_token(actor, &token).await?;
            let target = qr.target.service_type().unwrap_or("generic credits");
            println!("Token:    {}", qr.token);
            println!("Vehicle:  {}", qr.vehicle_id);
            println!("Spends:   {} x {}", qr.amount, target);
            println!("Expires:  {}", qr.expires_at.format("%Y-%m-%d %H:%M:%S"));
            println!("State:    {}", qr.state_at(Utc::now()));
        }
    }
    Ok(())
}

async fn run_check_command(engine: &LedgerEngine, actor: &Actor) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = engine.check_integrity(actor).await?;

    println!("Vehicles:     {}", report.vehicle_count);
    println!("Transactions: {}", report.transaction_count);
    println!();

    if report.has_sequence_gaps {
        println!("[!] Sequence numbers have gaps");
    }
    if report.duplicate_idempotency_keys > 0 {
        println!(
            "[!] {} duplicated idempotency keys",
            report.duplicate_idempotency_keys
        );
    }
    for entry in &report.mismatches {
        println!(
            "[!] {} {}: cached {}, log says {}",
            entry.vehicle_id, entry.dimension, entry.cached, entry.derived
        );
    }
    for entry in &report.negative_balances {
        println!(
            "[!] {} {} is negative",
            entry.vehicle_id, entry.dimension
        );
    }

    if report.is_healthy() {
        println!("Ledger is consistent.");
        Ok(())
    } else {
        anyhow::bail!("Ledger integrity check failed")
    }
}

fn print_balance(balance: &Balance) {
    println!("{:<24} {:>8}", "BALANCE", "UNITS");
    println!("{}", "-".repeat(33));
    println!("{:<24} {:>8}", "generic credits", balance.generic);
    for (service_type, units) in &balance.rights {
        println!("{:<24} {:>8}", service_type, units);
    }
}

fn print_history(transactions: &[LedgerTransaction]) {
    if transactions.is_empty() {
        println!("No transactions found.");
        return;
    }

    println!(
        "{:<17} {:<15} {:>7} {:<18} DESCRIPTION",
        "DATE", "TYPE", "AMOUNT", "SERVICE"
    );
    println!("{}", "-".repeat(80));

    for tx in transactions {
        println!(
            "{:<17} {:<15} {:>7} {:<18} {}",
            tx.created_at.format("%Y-%m-%d %H:%M"),
            tx.kind().as_str(),
            tx.delta(),
            truncate(tx.movement.service_type().unwrap_or("generic"), 18),
            truncate(&tx.description, 40)
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s.trim()).with_context(|| format!("'{}' is not a valid ID", s))
}

/// Parse a date string (YYYY-MM-DD) into the start of that day, UTC.
fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .context("Invalid time")
}

/// Parse a date string (YYYY-MM-DD) into the last microsecond of that day, UTC.
fn parse_end_of_day(date_str: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")?;
    date.and_hms_micro_opt(23, 59, 59, 999_999)
        .map(|dt| dt.and_utc())
        .context("Invalid time")
}
