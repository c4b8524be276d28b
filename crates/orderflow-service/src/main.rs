//! Main entry point for the orderflow service.
//!
//! Runs the workflow engine as a long-lived process that expires abandoned
//! claims, and offers one-shot subcommands that create orders, perform
//! actions and inspect pools against the same storage.

use clap::{Parser, Subcommand};
use orderflow_config::Config;
use orderflow_core::{ActionPayload, WorkflowEngine};
use orderflow_types::{Action, Actor, NewOrder, OrderStatus, RoleSet};
use serde_json::json;
use std::path::PathBuf;

mod factory_registry;

/// Command-line arguments for the orderflow service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config/orderflow.toml", env = "ORDERFLOW_CONFIG")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Restore claim timeouts and keep expiring them until Ctrl-C
	Run,
	/// Create an order in the `created` status
	Create {
		#[command(flatten)]
		user: UserArgs,
		#[arg(long)]
		client_name: String,
		#[arg(long)]
		product_type: String,
		#[arg(long)]
		client_email: Option<String>,
		#[arg(long)]
		client_phone: Option<String>,
		#[arg(long)]
		notes: Option<String>,
	},
	/// Perform a workflow action on an order
	Perform {
		order_id: String,
		/// submit, claim, complete, reject, approve, cancel or timeout
		action: Action,
		#[command(flatten)]
		user: UserArgs,
		/// Act as the system instead of a user (required for timeout)
		#[arg(long, conflicts_with_all = ["actor", "roles"])]
		system: bool,
		#[arg(long)]
		notes: Option<String>,
		#[arg(long)]
		tracking_number: Option<String>,
	},
	/// Print an order and its history
	Show {
		order_id: String,
		/// Roles of the viewer; client details are hidden from other roles
		#[arg(long, default_value = "")]
		roles: RoleSet,
	},
	/// List the orders in one or more statuses, oldest first
	Pool {
		#[arg(required_unless_present = "qc")]
		statuses: Vec<OrderStatus>,
		/// Every order awaiting quality control, across all stages
		#[arg(long, conflicts_with = "statuses")]
		qc: bool,
	},
}

#[derive(clap::Args, Debug)]
struct UserArgs {
	/// User id of the acting user
	#[arg(long)]
	actor: Option<String>,
	/// Comma separated roles, e.g. `editor,quality_control`
	#[arg(long, default_value = "")]
	roles: RoleSet,
}

impl UserArgs {
	fn actor(&self) -> Result<Actor, Box<dyn std::error::Error>> {
		let id = self.actor.clone().ok_or("--actor is required")?;
		Ok(Actor::User {
			id,
			roles: self.roles.clone(),
		})
	}
}

/// Main entry point for the orderflow service.
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging infrastructure
/// 3. Loads configuration from file
/// 4. Builds the engine with the configured storage backend
/// 5. Runs the requested subcommand
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	// Logs go to stderr so subcommand output on stdout stays valid JSON.
	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.with_writer(std::io::stderr)
		.init();

	let config_path = args
		.config
		.to_str()
		.ok_or("configuration path is not valid UTF-8")?;
	let config = Config::from_file(config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.service.id);

	let engine = factory_registry::build_engine_from_config(config)?;
	let result = execute(&engine, args.command).await;
	engine.scheduler().shutdown();
	result
}

async fn execute(
	engine: &WorkflowEngine,
	command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
	let orchestrator = engine.orchestrator();
	match command {
		Command::Run => {
			engine.run().await?;
		},
		Command::Create {
			user,
			client_name,
			product_type,
			client_email,
			client_phone,
			notes,
		} => {
			let new = NewOrder {
				product_type,
				client_name,
				client_email,
				client_phone,
				client_notes: notes,
			};
			let order = orchestrator.create_order(&user.actor()?, new).await?;
			print_json(&order)?;
		},
		Command::Perform {
			order_id,
			action,
			user,
			system,
			notes,
			tracking_number,
		} => {
			let actor = if system { Actor::System } else { user.actor()? };
			let payload = ActionPayload {
				notes,
				tracking_number,
			};
			let order = orchestrator
				.perform(&order_id, action, &actor, payload)
				.await?;
			let order = match actor.roles() {
				Some(roles) => order.redacted_for(roles),
				None => order,
			};
			print_json(&order)?;
		},
		Command::Show { order_id, roles } => {
			let order = orchestrator.get_redacted(&order_id, &roles).await?;
			let history = orchestrator.history(&order_id).await?;
			print_json(&json!({ "order": order, "history": history }))?;
		},
		Command::Pool { statuses, qc } => {
			let orders = if qc {
				orchestrator.qc_queue().await?
			} else {
				orchestrator.pools(&statuses).await?
			};
			print_json(&orders)?;
		},
	}
	Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), serde_json::Error> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}
