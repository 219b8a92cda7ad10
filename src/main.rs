mod auth;
mod classifier;
mod config;
mod db;
mod error;
mod gmail;
mod mailbox;
mod models;
mod sync;

use crate::auth::GoogleAuth;
use crate::classifier::{Classifier, ClassifierConfig};
use crate::config::Config;
use crate::gmail::GmailProvider;
use crate::mailbox::MailboxClient;
use crate::models::{Category, EmailFilter};
use crate::sync::SyncService;
use anyhow::{Context, bail};
use chrono::{Local, Utc};
use std::sync::Arc;
use tracing::Level;

const USAGE: &str = "usage: placemail [--debug] <command>

commands:
  auth-url <user>                      print the mailbox consent URL
  connect <user> <code>                finish the OAuth callback
  status <user>                        show connection state
  sync <user>                          fetch, classify and store placement mail
  disconnect <user>                    forget tokens and delete stored mail
  list <user> [category] [--starred] [--search <text>]
  stats <user>
  star <user> <id>                     toggle the star flag
  read <user> <id>                     mark as read
  categorize <user> <id> <category>    override the category
  delete <user> <id>                   remove from the tracker";

fn parse_id(raw: &str) -> anyhow::Result<i64> {
    raw.parse().with_context(|| format!("invalid email id '{}'", raw))
}

fn print_email(email: &models::StoredEmail) {
    let date = email.date.with_timezone(&Local).format("%Y-%m-%d %H:%M");
    println!(
        "{:>5} {} {}{} [{}] {} | {} | {}",
        email.id,
        date,
        if email.starred { "*" } else { " " },
        if email.is_read { " " } else { "U" },
        email.category,
        email.company.as_deref().unwrap_or("-"),
        email.from,
        email.subject,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    tracing_subscriber::fmt()
        .with_max_level(if debug_logging { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--debug")
        .collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    let rest: Vec<&str> = rest.iter().map(String::as_str).collect();

    let config = Config::load();
    let db = Arc::new(
        db::Database::new(&config.database_url)
            .await
            .context("Failed to open database")?,
    );
    db.run_migrations().await.context("Failed to apply schema")?;

    match (command.as_str(), rest.as_slice()) {
        ("auth-url", [user]) => {
            let auth = GoogleAuth::load(&config.oauth).await?;
            let url = auth.authorization_url(user)?;
            println!("{}", url);
            if let Err(e) = open::that(&url) {
                tracing::debug!("Could not open browser: {}", e);
            }
        }
        ("list", [user, options @ ..]) => {
            let mut filter = EmailFilter::default();
            let mut options = options.iter();
            while let Some(opt) = options.next() {
                match *opt {
                    "--starred" => filter.starred_only = true,
                    "--search" => {
                        let term = options.next().context("--search needs a value")?;
                        filter.search = Some(term.to_string());
                    }
                    "all" => filter.category = None,
                    other => {
                        let category = other.parse::<Category>().map_err(anyhow::Error::msg)?;
                        filter.category = Some(category);
                    }
                }
            }
            for email in db.list_emails(user, &filter).await? {
                print_email(&email);
            }
        }
        ("stats", [user]) => {
            let stats = db.email_stats(user, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        ("star", [user, id]) => print_email(&db.toggle_star(user, parse_id(id)?).await?),
        ("read", [user, id]) => print_email(&db.mark_read(user, parse_id(id)?).await?),
        ("categorize", [user, id, category]) => {
            let category = category.parse::<Category>().map_err(anyhow::Error::msg)?;
            print_email(&db.set_category(user, parse_id(id)?, category).await?);
        }
        ("delete", [user, id]) => {
            db.delete_email(user, parse_id(id)?).await?;
            println!("Email removed from tracker");
        }
        ("connect" | "status" | "sync" | "disconnect", _) => {
            let auth = Arc::new(GoogleAuth::load(&config.oauth).await?);
            let classifier = Arc::new(Classifier::new(ClassifierConfig::with_overrides(
                &config.classifier,
            )));
            let provider = Arc::new(GmailProvider::new()?);
            let mailbox = MailboxClient::new(provider, classifier, &config.sync);
            let service = SyncService::new(db.clone(), db.clone(), auth, mailbox, &config.sync);

            match (command.as_str(), rest.as_slice()) {
                ("connect", [user, code]) => {
                    let status = service.connect(user, code).await?;
                    println!(
                        "Connected {}",
                        status.account_email.as_deref().unwrap_or("mailbox")
                    );
                }
                ("status", [user]) => {
                    println!("{}", serde_json::to_string_pretty(&service.status(user).await?)?);
                }
                ("sync", [user]) => {
                    let report = service.sync(user).await?;
                    println!("Synced {} placement-related emails", report.ingested);
                    if report.skipped > 0 {
                        println!("{} emails could not be stored", report.skipped);
                    }
                }
                ("disconnect", [user]) => {
                    let removed = service.disconnect(user).await?;
                    println!("Mailbox disconnected, {} emails removed", removed);
                }
                _ => bail!("{}", USAGE),
            }
        }
        _ => bail!("{}", USAGE),
    }

    Ok(())
}
