use crate::error::StoreError;
use crate::models::{
    Category, Credential, EmailFilter, EmailStats, NormalizedEmail, RefreshedToken, StoredEmail,
    SyncLease, TokenGrant,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

const LIST_LIMIT: i64 = 100;

const EMAIL_COLUMNS: &str = "id, user_id, provider_message_id, thread_id, from_address, to_address, subject, \
     snippet, body, date, labels, is_read, category, company, starred, fetched_at";

/// Changes the sync core makes to a user's credential.
#[derive(Debug, Clone)]
pub enum CredentialUpdate {
    Connected {
        grant: TokenGrant,
        account_email: Option<String>,
    },
    Refreshed(RefreshedToken),
    /// Nulls every token field and clears `connected`.
    Disconnected,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<Credential>, StoreError>;

    async fn update(&self, user_id: &str, update: CredentialUpdate) -> Result<(), StoreError>;

    /// Claims the user's sync slot. Returns `None` while someone else holds a
    /// lease younger than `stale_after`; an older lease is taken over.
    async fn acquire_lease(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<SyncLease>, StoreError>;

    /// Gives the slot back. A lease that was already taken over is left alone.
    async fn release_lease(&self, lease: &SyncLease) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Inserts or overwrites the row keyed by `(user_id, provider_message_id)`.
    /// `starred` is never touched by an overwrite.
    async fn upsert(
        &self,
        user_id: &str,
        email: &NormalizedEmail,
    ) -> Result<StoredEmail, StoreError>;

    async fn delete_all(&self, user_id: &str) -> Result<u64, StoreError>;
}

pub struct Database {
    pool: SqlitePool,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", ms)))
}

fn row_to_email(row: &SqliteRow) -> Result<StoredEmail, StoreError> {
    let labels: String = row.try_get("labels")?;
    let category: String = row.try_get("category")?;

    Ok(StoredEmail {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider_message_id: row.try_get("provider_message_id")?,
        thread_id: row.try_get("thread_id")?,
        from: row.try_get("from_address")?,
        to: row.try_get("to_address")?,
        subject: row.try_get("subject")?,
        snippet: row.try_get("snippet")?,
        body: row.try_get("body")?,
        date: from_millis(row.try_get("date")?)?,
        labels: serde_json::from_str(&labels)?,
        is_read: row.try_get("is_read")?,
        category: category.parse::<Category>().map_err(StoreError::Corrupt)?,
        company: row.try_get("company")?,
        starred: row.try_get("starred")?,
        fetched_at: from_millis(row.try_get("fetched_at")?)?,
    })
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::connect(database_url, 5).await
    }

    /// In-memory databases need `max_connections = 1`; every pooled
    /// connection would otherwise open its own empty database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get_email(&self, user_id: &str, id: i64) -> Result<StoredEmail, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM emails WHERE user_id = ? AND id = ?",
            EMAIL_COLUMNS
        ))
        .bind(user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        row_to_email(&row)
    }

    /// Newest first, at most 100 rows. `search` matches subject, sender or
    /// company, case-insensitively.
    pub async fn list_emails(
        &self,
        user_id: &str,
        filter: &EmailFilter,
    ) -> Result<Vec<StoredEmail>, StoreError> {
        let mut sql = format!("SELECT {} FROM emails WHERE user_id = ?", EMAIL_COLUMNS);
        if filter.category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if filter.starred_only {
            sql.push_str(" AND starred = 1");
        }
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));
        if search.is_some() {
            sql.push_str(" AND (subject LIKE ? OR from_address LIKE ? OR company LIKE ?)");
        }
        sql.push_str(" ORDER BY date DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(user_id);
        if let Some(category) = filter.category {
            query = query.bind(category.as_str());
        }
        if let Some(term) = &search {
            query = query.bind(term).bind(term).bind(term);
        }

        let rows = query.bind(LIST_LIMIT).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_email).collect()
    }

    pub async fn email_stats(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EmailStats, StoreError> {
        let week_ago = to_millis(now - Duration::days(7));
        let row = sqlx::query(
            "SELECT COUNT(*), COUNT(CASE WHEN is_read = 0 THEN 1 END), COUNT(CASE WHEN date > ? THEN 1 END)
             FROM emails WHERE user_id = ?",
        )
        .bind(week_ago)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let mut stats = EmailStats {
            total: row.get(0),
            unread: row.get(1),
            recent: row.get(2),
            ..Default::default()
        };

        let rows = sqlx::query(
            "SELECT category, COUNT(*) FROM emails WHERE user_id = ? GROUP BY category",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        for r in rows {
            let category: Category = r.get::<String, _>(0).parse().map_err(StoreError::Corrupt)?;
            stats.by_category.insert(category, r.get(1));
        }

        let rows = sqlx::query(
            "SELECT company, COUNT(*) FROM emails WHERE user_id = ? AND company IS NOT NULL GROUP BY company",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        stats.by_company = rows.into_iter().map(|r| (r.get(0), r.get(1))).collect();

        Ok(stats)
    }

    pub async fn toggle_star(&self, user_id: &str, id: i64) -> Result<StoredEmail, StoreError> {
        let result =
            sqlx::query("UPDATE emails SET starred = NOT starred WHERE user_id = ? AND id = ?")
                .bind(user_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.get_email(user_id, id).await
    }

    pub async fn mark_read(&self, user_id: &str, id: i64) -> Result<StoredEmail, StoreError> {
        let result = sqlx::query("UPDATE emails SET is_read = 1 WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.get_email(user_id, id).await
    }

    /// Manual override. The next sync that sees the message recomputes it.
    pub async fn set_category(
        &self,
        user_id: &str,
        id: i64,
        category: Category,
    ) -> Result<StoredEmail, StoreError> {
        let result = sqlx::query("UPDATE emails SET category = ? WHERE user_id = ? AND id = ?")
            .bind(category.as_str())
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.get_email(user_id, id).await
    }

    pub async fn delete_email(&self, user_id: &str, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM emails WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for Database {
    async fn get(&self, user_id: &str) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, access_token, refresh_token, token_expiry, connected, account_email
             FROM credentials WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expiry: Option<i64> = row.try_get("token_expiry")?;

        Ok(Some(Credential {
            user_id: row.try_get("user_id")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            token_expiry: expiry.map(from_millis).transpose()?,
            connected: row.try_get("connected")?,
            account_email: row.try_get("account_email")?,
        }))
    }

    async fn update(&self, user_id: &str, update: CredentialUpdate) -> Result<(), StoreError> {
        match update {
            CredentialUpdate::Connected {
                grant,
                account_email,
            } => {
                sqlx::query(
                    "INSERT INTO credentials (user_id, access_token, refresh_token, token_expiry, connected, account_email)
                     VALUES (?, ?, ?, ?, 1, ?)
                     ON CONFLICT(user_id) DO UPDATE SET access_token=excluded.access_token,
                     refresh_token=excluded.refresh_token, token_expiry=excluded.token_expiry,
                     connected=1, account_email=excluded.account_email",
                )
                .bind(user_id)
                .bind(&grant.access_token)
                .bind(&grant.refresh_token)
                .bind(to_millis(grant.expiry))
                .bind(&account_email)
                .execute(&self.pool)
                .await?;
            }
            CredentialUpdate::Refreshed(token) => {
                sqlx::query(
                    "UPDATE credentials SET access_token = ?, token_expiry = ? WHERE user_id = ?",
                )
                .bind(&token.access_token)
                .bind(to_millis(token.expiry))
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            }
            CredentialUpdate::Disconnected => {
                sqlx::query(
                    "UPDATE credentials SET access_token = NULL, refresh_token = NULL, token_expiry = NULL,
                     connected = 0, account_email = NULL WHERE user_id = ?",
                )
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<SyncLease>, StoreError> {
        let acquired_at = to_millis(now);
        let result = sqlx::query(
            "INSERT INTO sync_leases (user_id, acquired_at) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET acquired_at = excluded.acquired_at
             WHERE sync_leases.acquired_at < ?",
        )
        .bind(user_id)
        .bind(acquired_at)
        .bind(to_millis(now - stale_after))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(SyncLease {
            user_id: user_id.to_string(),
            acquired_at: from_millis(acquired_at)?,
        }))
    }

    async fn release_lease(&self, lease: &SyncLease) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_leases WHERE user_id = ? AND acquired_at = ?")
            .bind(&lease.user_id)
            .bind(to_millis(lease.acquired_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EmailStore for Database {
    async fn upsert(
        &self,
        user_id: &str,
        email: &NormalizedEmail,
    ) -> Result<StoredEmail, StoreError> {
        let labels = serde_json::to_string(&email.labels)?;
        let row = sqlx::query(&format!(
            "INSERT INTO emails (user_id, provider_message_id, thread_id, from_address, to_address, subject,
                 snippet, body, date, labels, is_read, category, company, fetched_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, provider_message_id) DO UPDATE SET thread_id=excluded.thread_id,
             from_address=excluded.from_address, to_address=excluded.to_address, subject=excluded.subject,
             snippet=excluded.snippet, body=excluded.body, date=excluded.date, labels=excluded.labels,
             is_read=excluded.is_read, category=excluded.category, company=excluded.company,
             fetched_at=excluded.fetched_at
             RETURNING {}",
            EMAIL_COLUMNS
        ))
        .bind(user_id)
        .bind(&email.provider_message_id)
        .bind(&email.thread_id)
        .bind(&email.from)
        .bind(&email.to)
        .bind(&email.subject)
        .bind(&email.snippet)
        .bind(&email.body)
        .bind(to_millis(email.date))
        .bind(labels)
        .bind(email.is_read)
        .bind(email.category.as_str())
        .bind(&email.company)
        .bind(to_millis(email.fetched_at))
        .fetch_one(&self.pool)
        .await?;

        row_to_email(&row)
    }

    async fn delete_all(&self, user_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM emails WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classifier::tests::email;

    pub(crate) async fn memory_db() -> Database {
        let db = Database::connect("sqlite::memory:", 1).await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    pub(crate) async fn execute(db: &Database, sql: &str) {
        sqlx::query(sql).execute(&db.pool).await.unwrap();
    }

    pub(crate) async fn lease_held(db: &Database, user_id: &str) -> bool {
        sqlx::query("SELECT 1 FROM sync_leases WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&db.pool)
            .await
            .unwrap()
            .is_some()
    }

    fn placement(id: &str, subject: &str, from: &str, category: Category) -> NormalizedEmail {
        let mut e = email(from, subject, "");
        e.provider_message_id = id.to_string();
        e.category = category;
        e.labels = vec!["INBOX".to_string()];
        e
    }

    #[tokio::test]
    async fn upsert_overwrites_but_keeps_star() {
        let db = memory_db().await;
        let first = db
            .upsert(
                "u1",
                &placement("m1", "Application received", "hr@acme.io", Category::Application),
            )
            .await
            .unwrap();
        db.toggle_star("u1", first.id).await.unwrap();

        let mut changed =
            placement("m1", "Interview scheduled", "talent@acme.io", Category::Interview);
        changed.is_read = true;
        changed.company = Some("Acme".to_string());
        let second = db.upsert("u1", &changed).await.unwrap();

        assert_eq!(second.id, first.id);
        assert!(second.starred);
        assert_eq!(second.subject, "Interview scheduled");
        assert_eq!(second.category, Category::Interview);
        assert_eq!(second.company.as_deref(), Some("Acme"));
        assert!(second.is_read);
        assert_eq!(second.labels, vec!["INBOX".to_string()]);
        assert_eq!(db.list_emails("u1", &EmailFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_message_id_is_separate_per_user() {
        let db = memory_db().await;
        let mail = placement("m1", "Offer letter", "hr@acme.io", Category::Offer);
        db.upsert("u1", &mail).await.unwrap();
        db.upsert("u2", &mail).await.unwrap();

        assert_eq!(db.delete_all("u1").await.unwrap(), 1);
        assert!(db.list_emails("u1", &EmailFilter::default()).await.unwrap().is_empty());
        assert_eq!(db.list_emails("u2", &EmailFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_category_star_and_search() {
        let db = memory_db().await;
        let a = db
            .upsert(
                "u1",
                &placement("m1", "Online test", "tests@hackerrank.com", Category::Assessment),
            )
            .await
            .unwrap();
        let mut offer = placement("m2", "Offer letter", "hr@acme.io", Category::Offer);
        offer.company = Some("Acme".to_string());
        db.upsert("u1", &offer).await.unwrap();
        db.toggle_star("u1", a.id).await.unwrap();

        let by_category = db
            .list_emails(
                "u1",
                &EmailFilter {
                    category: Some(Category::Offer),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_category.len(), 1);
        assert_eq!(by_category[0].provider_message_id, "m2");

        let starred = db
            .list_emails(
                "u1",
                &EmailFilter {
                    starred_only: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(starred.len(), 1);
        assert_eq!(starred[0].provider_message_id, "m1");

        let search = db
            .list_emails(
                "u1",
                &EmailFilter {
                    search: Some("ACME".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(search.len(), 1);
        assert_eq!(search[0].company.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn stats_count_by_category_and_company() {
        let db = memory_db().await;
        let mut one = placement("m1", "Offer letter", "hr@acme.io", Category::Offer);
        one.company = Some("Acme".to_string());
        let mut two = placement("m2", "Interview", "hr@acme.io", Category::Interview);
        two.company = Some("Acme".to_string());
        two.is_read = true;
        let mut old = placement("m3", "Application received", "x@y.io", Category::Application);
        old.date = Utc::now() - Duration::days(20);
        for e in [&one, &two, &old] {
            db.upsert("u1", e).await.unwrap();
        }

        let stats = db.email_stats("u1", Utc::now()).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unread, 2);
        assert_eq!(stats.recent, 2);
        assert_eq!(stats.by_category[&Category::Offer], 1);
        assert_eq!(stats.by_company["Acme"], 2);
        assert!(!stats.by_category.contains_key(&Category::Rejection));
    }

    #[tokio::test]
    async fn row_operations_are_scoped_to_owner() {
        let db = memory_db().await;
        let stored = db
            .upsert("u1", &placement("m1", "Offer letter", "hr@acme.io", Category::Offer))
            .await
            .unwrap();

        assert!(matches!(db.mark_read("u2", stored.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(db.delete_email("u2", stored.id).await, Err(StoreError::NotFound(_))));

        let read = db.mark_read("u1", stored.id).await.unwrap();
        assert!(read.is_read);
        let recategorized = db.set_category("u1", stored.id, Category::Rejection).await.unwrap();
        assert_eq!(recategorized.category, Category::Rejection);

        db.delete_email("u1", stored.id).await.unwrap();
        assert!(matches!(db.get_email("u1", stored.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn credential_lifecycle() {
        let db = memory_db().await;
        assert!(db.get("u1").await.unwrap().is_none());

        let expiry = Utc.timestamp_millis_opt(1_800_000_000_000).unwrap();
        db.update(
            "u1",
            CredentialUpdate::Connected {
                grant: TokenGrant {
                    access_token: "a1".to_string(),
                    refresh_token: Some("r1".to_string()),
                    expiry,
                },
                account_email: Some("me@gmail.com".to_string()),
            },
        )
        .await
        .unwrap();

        let cred = db.get("u1").await.unwrap().unwrap();
        assert!(cred.connected);
        assert_eq!(cred.refresh_token.as_deref(), Some("r1"));
        assert_eq!(cred.token_expiry, Some(expiry));

        db.update(
            "u1",
            CredentialUpdate::Refreshed(RefreshedToken {
                access_token: "a2".to_string(),
                expiry: expiry + Duration::hours(1),
            }),
        )
        .await
        .unwrap();
        let cred = db.get("u1").await.unwrap().unwrap();
        assert_eq!(cred.access_token.as_deref(), Some("a2"));
        assert_eq!(cred.refresh_token.as_deref(), Some("r1"));

        db.update("u1", CredentialUpdate::Disconnected).await.unwrap();
        let cred = db.get("u1").await.unwrap().unwrap();
        assert!(!cred.connected);
        assert!(cred.access_token.is_none());
        assert!(cred.refresh_token.is_none());
        assert!(cred.account_email.is_none());
    }

    #[tokio::test]
    async fn lease_excludes_until_released_or_stale() {
        let db = memory_db().await;
        let t0 = Utc.timestamp_millis_opt(1_800_000_000_000).unwrap();
        let ttl = Duration::minutes(15);

        let first = db.acquire_lease("u1", t0, ttl).await.unwrap().unwrap();
        assert_eq!(first.acquired_at, t0);
        assert!(db.acquire_lease("u1", t0 + Duration::minutes(1), ttl).await.unwrap().is_none());
        assert!(db.acquire_lease("u2", t0, ttl).await.unwrap().is_some());

        db.release_lease(&first).await.unwrap();
        assert!(!lease_held(&db, "u1").await);
        assert!(db.acquire_lease("u1", t0 + Duration::minutes(2), ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_lease_is_taken_over_and_old_holder_cannot_release_it() {
        let db = memory_db().await;
        let t0 = Utc.timestamp_millis_opt(1_800_000_000_000).unwrap();
        let ttl = Duration::minutes(15);

        let abandoned = db.acquire_lease("u1", t0, ttl).await.unwrap().unwrap();
        let later = t0 + Duration::minutes(20);
        let current = db.acquire_lease("u1", later, ttl).await.unwrap().unwrap();
        assert_eq!(current.acquired_at, later);

        db.release_lease(&abandoned).await.unwrap();
        assert!(lease_held(&db, "u1").await);
        assert!(db.acquire_lease("u1", later + Duration::minutes(1), ttl).await.unwrap().is_none());
    }
}
