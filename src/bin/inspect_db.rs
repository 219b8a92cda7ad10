use anyhow::{Context, bail};
use chrono::{TimeZone, Utc};
use inflections::case::to_title_case;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::env;

const RULE: &str = "--------------------------------------------------------------------------------";
const LISTED: i64 = 20;

fn format_date(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(ts) => ts.format("%Y-%m-%d %H:%M").to_string(),
        None => format!("<invalid {}>", ms),
    }
}

async fn print_stats(pool: &SqlitePool, user_id: &str) -> anyhow::Result<()> {
    let totals = sqlx::query(
        "SELECT COUNT(*), COUNT(CASE WHEN is_read = 0 THEN 1 END), COUNT(CASE WHEN starred = 1 THEN 1 END)
         FROM emails WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    println!(
        "Stored: {}  Unread: {}  Starred: {}",
        totals.get::<i64, _>(0),
        totals.get::<i64, _>(1),
        totals.get::<i64, _>(2)
    );

    let by_category = sqlx::query(
        "SELECT category, COUNT(*) FROM emails WHERE user_id = ? GROUP BY category ORDER BY category",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    for row in by_category {
        println!(
            "  {:<12} {}",
            to_title_case(&row.get::<String, _>(0)),
            row.get::<i64, _>(1)
        );
    }
    Ok(())
}

fn print_full(row: &SqliteRow) {
    let labels: String = row.get("labels");
    let labels: Vec<String> = serde_json::from_str(&labels).unwrap_or_default();
    let body: String = row.get("body");

    println!("Found Email:");
    println!("Provider ID: {}", row.get::<String, _>("provider_message_id"));
    println!("Thread: {:?}", row.get::<Option<String>, _>("thread_id"));
    println!("From: {}", row.get::<String, _>("from_address"));
    println!("Subject: {}", row.get::<String, _>("subject"));
    println!("Date: {}", format_date(row.get("date")));
    println!("Category: {}", to_title_case(&row.get::<String, _>("category")));
    println!(
        "Company: {}",
        row.get::<Option<String>, _>("company").as_deref().unwrap_or("(none)")
    );
    println!("Labels: {}", labels.join(", "));
    println!("{}", RULE);
    println!("BODY ({} chars, Raw Debug):", body.chars().count());
    println!("{:?}", body);
    println!("{}", RULE);
    println!("BODY (Display):");
    println!("{}", body);
    println!("{}", RULE);
}

#[derive(Debug, PartialEq)]
struct Args {
    user_id: String,
    search: Option<String>,
    database_url: String,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut database_url = "sqlite://placemail.db".to_string();
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => database_url = args.next().context("--db needs a value")?,
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let (Some(user_id), search, None) = (positional.next(), positional.next(), positional.next())
    else {
        bail!("usage: inspect_db <user_id> [search] [--db <database_url>]");
    };
    Ok(Args {
        user_id,
        search,
        database_url,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args(env::args().skip(1))?;
    let user_id = args.user_id.as_str();
    let search = args.search.as_deref();
    let database_url = &args.database_url;

    let pool = SqlitePoolOptions::new()
        .connect(database_url)
        .await
        .with_context(|| format!("Failed to connect to {}", database_url))?;

    print_stats(&pool, user_id).await?;
    println!("{}", RULE);

    let pattern = format!("%{}%", search.unwrap_or_default());
    let rows = sqlx::query(
        "SELECT id, provider_message_id, thread_id, from_address, subject, date, labels, category,
                company, starred, is_read, body
         FROM emails
         WHERE user_id = ? AND (from_address LIKE ? OR subject LIKE ? OR company LIKE ?)
         ORDER BY date DESC
         LIMIT ?",
    )
    .bind(user_id)
    .bind(&pattern)
    .bind(&pattern)
    .bind(&pattern)
    .bind(LISTED)
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("No stored emails for {} matching '{}'", user_id, search.unwrap_or_default());
        return Ok(());
    }

    for row in &rows {
        println!(
            "{:>5} {} {}{} [{}] {} | {}",
            row.get::<i64, _>("id"),
            format_date(row.get("date")),
            if row.get::<bool, _>("starred") { "*" } else { " " },
            if row.get::<bool, _>("is_read") { " " } else { "U" },
            row.get::<String, _>("category"),
            row.get::<String, _>("from_address"),
            row.get::<String, _>("subject"),
        );
    }

    if search.is_some() {
        println!("{}", RULE);
        print_full(&rows[0]);
    }

    Ok(())
}
