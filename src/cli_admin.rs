use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

mod cli_style;

use cli_style::{format_timestamp, get_styles, print_table};

use newsletter_server::clock::{Clock, SystemClock};
use newsletter_server::deliverability::{load_email_stats, reset_email_stats};
use newsletter_server::newsletter_store::{
    normalize_email, EmailQueueStore, SqliteNewsletterStore, SubscriberFilter, SubscriberStore,
};
use newsletter_server::server_store::{ServerStore, SqliteServerStore};

use rustyline::{
    completion::Completer, highlight::Highlighter, history::FileHistory, validate::Validator,
    CompletionType, Config, Editor, Helper,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Directory holding newsletter.db and server.db.
    #[clap(value_parser = parse_path, default_value = ".")]
    pub db_dir: PathBuf,
}

#[derive(Parser)]
#[command(styles=get_styles(),name = "")]
struct InnerCli {
    #[command(subcommand)]
    command: InnerCommand,
}

#[derive(Subcommand)]
enum InnerCommand {
    /// Lists subscribers, newest first.
    Subscribers {
        /// Substring of the address, must contain '@'.
        #[clap(long)]
        search: Option<String>,
        /// Only show unverified subscribers.
        #[clap(long)]
        unverified: bool,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },

    /// Adds a subscriber, or updates the verified flag of an existing one.
    AddSubscriber {
        email: String,
        #[clap(long)]
        verified: bool,
    },

    /// Marks a subscriber as verified.
    Verify { email: String },

    /// Removes a subscriber.
    Delete { email: String },

    /// Deletes every unverified subscriber.
    PurgeUnverified,

    /// Shows the email queue counters.
    QueueStats,

    /// Drops every email that was not sent yet.
    ClearPending,

    /// Shows sent and failed counters and the resulting reputation.
    EmailStats,

    /// Zeroes the sent and failed counters.
    ResetStats,

    /// Shows the most recent email activity.
    Activity {
        #[clap(default_value_t = 20)]
        limit: usize,
    },

    /// Shows the path of the current database directory.
    Where,

    /// Close this program.
    Exit,
}

enum CommandExecutionResult {
    Ok,
    Exit,
    Error(String),
}

const PROMPT: &str = ">> ";

struct Stores {
    newsletter: SqliteNewsletterStore,
    server: SqliteServerStore,
    clock: SystemClock,
}

fn run_command(command: InnerCommand, stores: &Stores, db_dir: &str) -> Result<CommandExecutionResult> {
    match command {
        InnerCommand::Subscribers {
            search,
            unverified,
            limit,
        } => {
            let filter = SubscriberFilter {
                search,
                verified: if unverified { Some(false) } else { None },
                limit,
                ..Default::default()
            };
            let subscribers = stores.newsletter.list_subscribers(&filter)?;
            let total = stores.newsletter.count_subscribers(&filter)?;
            let rows = subscribers
                .iter()
                .map(|s| {
                    vec![
                        s.id.to_string(),
                        s.email.clone(),
                        if s.verified { "yes" } else { "no" }.to_string(),
                        format_timestamp(s.created_at),
                    ]
                })
                .collect::<Vec<_>>();
            print_table(&["ID", "EMAIL", "VERIFIED", "CREATED"], &rows);
            println!("\n{} of {} subscribers", subscribers.len(), total);
        }
        InnerCommand::AddSubscriber { email, verified } => {
            let subscriber = stores
                .newsletter
                .add_or_update_subscriber(&email, Some(verified), stores.clock.now())?;
            println!(
                "Subscriber {} ({}) saved, verified: {}",
                subscriber.email, subscriber.id, subscriber.verified
            );
        }
        InnerCommand::Verify { email } => {
            if stores.newsletter.mark_verified(&normalize_email(&email))? {
                println!("{} is now verified", email);
            } else {
                return Ok(CommandExecutionResult::Error(format!(
                    "No unverified subscriber '{}'",
                    email
                )));
            }
        }
        InnerCommand::Delete { email } => {
            if stores.newsletter.delete_subscriber(&normalize_email(&email))? {
                println!("{} removed", email);
            } else {
                return Ok(CommandExecutionResult::Error(format!(
                    "Subscriber '{}' not found",
                    email
                )));
            }
        }
        InnerCommand::PurgeUnverified => {
            let count = stores.newsletter.delete_unverified()?;
            println!("Deleted {} unverified subscribers", count);
        }
        InnerCommand::QueueStats => {
            let stats = stores.newsletter.queue_stats(stores.clock.now())?;
            println!("Total:   {}", stats.total);
            println!("Pending: {} ({} due)", stats.pending, stats.due);
            println!("Sent:    {}", stats.sent);
        }
        InnerCommand::ClearPending => {
            let count = stores.newsletter.delete_pending()?;
            println!("Deleted {} pending emails", count);
        }
        InnerCommand::EmailStats => {
            let stats = load_email_stats(&stores.server)?;
            println!("Sent:       {}", stats.sent);
            println!("Failed:     {}", stats.failed);
            println!("Reputation: {:.1}%", stats.reputation() * 100.0);
            if stats.last_reset > 0 {
                println!("Since:      {}", format_timestamp(stats.last_reset));
            }
        }
        InnerCommand::ResetStats => {
            reset_email_stats(&stores.server, stores.clock.now())?;
            println!("Email stats reset");
        }
        InnerCommand::Activity { limit } => {
            let activity = stores.server.get_email_activity(limit, 0)?;
            let rows = activity
                .into_iter()
                .map(|a| {
                    vec![
                        format_timestamp(a.timestamp),
                        a.action,
                        a.email,
                        a.details.unwrap_or_default(),
                    ]
                })
                .collect::<Vec<_>>();
            print_table(&["WHEN", "ACTION", "EMAIL", "DETAILS"], &rows);
        }
        InnerCommand::Where => {
            println!("Databases are in {}", db_dir);
        }
        InnerCommand::Exit => return Ok(CommandExecutionResult::Exit),
    }
    Ok(CommandExecutionResult::Ok)
}

fn execute_command(line: String, stores: &Stores, db_dir: &str) -> CommandExecutionResult {
    if line.is_empty() {
        return CommandExecutionResult::Ok;
    }

    let args =
        shlex::split(&line).unwrap_or_else(|| line.split_whitespace().map(String::from).collect());

    let cli = InnerCli::try_parse_from(std::iter::once(" ").chain(args.iter().map(String::as_str)));

    match cli {
        Ok(cli) => {
            println!("{} {}", PROMPT, &line);
            match run_command(cli.command, stores, db_dir) {
                Ok(result) => result,
                Err(err) => CommandExecutionResult::Error(format!("{:#}", err)),
            }
        }
        Err(e) => {
            if e.print().is_err() {
                println!("{}", e);
            }
            CommandExecutionResult::Ok
        }
    }
}

#[derive(rustyline_derive::Hinter)]
struct MyHelper {
    commands_names: Vec<String>,
}

impl MyHelper {
    pub fn new() -> Self {
        let commands_names: Vec<String> = InnerCli::command()
            .get_subcommands()
            .map(|sc| sc.get_name().to_string())
            .collect();

        MyHelper { commands_names }
    }
}

impl Completer for MyHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if line.contains(' ') {
            return Ok((0, Vec::with_capacity(0)));
        }
        let matches = self
            .commands_names
            .iter()
            .filter(|c| c.starts_with(line))
            .map(|c| c.to_string())
            .collect::<Vec<_>>();

        Ok((0, matches))
    }
}

impl Highlighter for MyHelper {}
impl Validator for MyHelper {}
impl Helper for MyHelper {}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let stores = Stores {
        newsletter: SqliteNewsletterStore::new(cli_args.db_dir.join("newsletter.db"))?,
        server: SqliteServerStore::new(cli_args.db_dir.join("server.db"))?,
        clock: SystemClock,
    };
    let db_dir = cli_args.db_dir.display().to_string();

    InnerCli::command().print_long_help()?;

    let config = Config::builder()
        .completion_type(CompletionType::List)
        .build();

    let mut rl = Editor::<MyHelper, FileHistory>::with_config(config)?;

    let helper = MyHelper::new();
    rl.set_helper(Some(helper));

    loop {
        let readline = rl.readline(PROMPT);

        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                match execute_command(line, &stores, &db_dir) {
                    CommandExecutionResult::Ok => {}
                    CommandExecutionResult::Exit => {
                        break;
                    }
                    CommandExecutionResult::Error(err) => {
                        eprintln!("Error: {}", err);
                        continue;
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("CTRL-D: exiting.");
                break;
            }
            Err(e) => {
                println!("Error: {:?}", e);
                break;
            }
        }
    }
    Ok(())
}
