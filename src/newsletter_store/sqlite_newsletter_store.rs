use super::models::*;
use super::schema::NEWSLETTER_VERSIONED_SCHEMAS;
use super::{DownloadTokenStore, EmailQueueStore, SubscriberStore};
use crate::sqlite_persistence::{open_in_memory_db, open_versioned_db, sql_count};
use anyhow::Result;
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SUBSCRIBER_COLUMNS: &str = "id, email, verified, created_at";
const QUEUE_COLUMNS: &str = "id, recipient, subject, body, headers, send_at, sent, sent_at";
const DOWNLOAD_TOKEN_COLUMNS: &str =
    "id, email, token, file_url, post_id, block_id, created_at, expires_at, used, verified";

pub struct SqliteNewsletterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNewsletterStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), NEWSLETTER_VERSIONED_SCHEMAS, "newsletter")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = open_in_memory_db(NEWSLETTER_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_subscriber(row: &rusqlite::Row) -> rusqlite::Result<Subscriber> {
        Ok(Subscriber {
            id: row.get("id")?,
            email: row.get("email")?,
            verified: row.get("verified")?,
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_queued_email(row: &rusqlite::Row) -> rusqlite::Result<QueuedEmail> {
        let headers: Option<String> = row.get("headers")?;
        Ok(QueuedEmail {
            id: row.get("id")?,
            recipient: row.get("recipient")?,
            subject: row.get("subject")?,
            body: row.get("body")?,
            headers: headers
                .and_then(|h| serde_json::from_str(&h).ok())
                .unwrap_or_default(),
            send_at: row.get("send_at")?,
            sent: row.get("sent")?,
            sent_at: row.get("sent_at")?,
        })
    }

    fn row_to_download_token(row: &rusqlite::Row) -> rusqlite::Result<DownloadToken> {
        Ok(DownloadToken {
            id: row.get("id")?,
            email: row.get("email")?,
            token: row.get("token")?,
            file_url: row.get("file_url")?,
            post_id: row.get("post_id")?,
            block_id: row.get("block_id")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
            used: row.get("used")?,
            verified: row.get("verified")?,
        })
    }

    fn subscriber_where(filter: &SubscriberFilter) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(search) = filter.effective_search() {
            clauses.push("email LIKE ?");
            values.push(Value::Text(format!("%{}%", search.to_lowercase())));
        }
        if let Some(verified) = filter.verified {
            clauses.push("verified = ?");
            values.push(Value::Integer(verified as i64));
        }
        (where_sql(&clauses), values)
    }

    fn queue_where(status: Option<QueueStatusFilter>) -> String {
        match status {
            Some(QueueStatusFilter::Sent) => " WHERE sent = 1".to_string(),
            Some(QueueStatusFilter::Pending) => " WHERE sent = 0".to_string(),
            None => String::new(),
        }
    }

    /// Runs `sql` with `ids` bound to its `IN ({ids})` placeholder list.
    fn execute_for_ids(&self, sql: &str, leading: Vec<Value>, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = sql.replace("{ids}", &placeholders(ids.len()));
        let values = leading
            .into_iter()
            .chain(ids.iter().map(|id| Value::Integer(*id)));
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(&sql, params_from_iter(values))?)
    }
}

fn where_sql(clauses: &[&str]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn direction(descending: bool) -> &'static str {
    if descending {
        "DESC"
    } else {
        "ASC"
    }
}

impl SubscriberStore for SqliteNewsletterStore {
    fn add_or_update_subscriber(
        &self,
        email: &str,
        verified: Option<bool>,
        now: i64,
    ) -> Result<Subscriber> {
        let email = normalize_email(email);
        let conn = self.conn.lock().unwrap();

        match verified {
            Some(verified) => conn.execute(
                "INSERT INTO subscribers (email, verified, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(email) DO UPDATE SET verified = excluded.verified",
                params![email, verified, now],
            )?,
            None => conn.execute(
                "INSERT INTO subscribers (email, verified, created_at) VALUES (?1, 0, ?2)
                 ON CONFLICT(email) DO NOTHING",
                params![email, now],
            )?,
        };

        let subscriber = conn.query_row(
            &format!("SELECT {} FROM subscribers WHERE email = ?1", SUBSCRIBER_COLUMNS),
            params![email],
            Self::row_to_subscriber,
        )?;
        Ok(subscriber)
    }

    fn get_subscriber(&self, email: &str) -> Result<Option<Subscriber>> {
        let conn = self.conn.lock().unwrap();
        let subscriber = conn
            .query_row(
                &format!("SELECT {} FROM subscribers WHERE email = ?1", SUBSCRIBER_COLUMNS),
                params![normalize_email(email)],
                Self::row_to_subscriber,
            )
            .optional()?;
        Ok(subscriber)
    }

    fn is_subscriber_verified(&self, email: &str) -> Result<bool> {
        Ok(self
            .get_subscriber(email)?
            .map(|s| s.verified)
            .unwrap_or(false))
    }

    fn mark_verified(&self, email: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE subscribers SET verified = 1 WHERE email = ?1 AND verified = 0",
            params![normalize_email(email)],
        )?;
        Ok(changed > 0)
    }

    fn delete_subscriber(&self, email: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM subscribers WHERE email = ?1",
            params![normalize_email(email)],
        )?;
        Ok(deleted > 0)
    }

    fn list_subscribers(&self, filter: &SubscriberFilter) -> Result<Vec<Subscriber>> {
        let (where_clause, mut values) = Self::subscriber_where(filter);
        let sql = format!(
            "SELECT {} FROM subscribers{} ORDER BY {} {}, id {} LIMIT ? OFFSET ?",
            SUBSCRIBER_COLUMNS,
            where_clause,
            filter.order_by.column(),
            direction(filter.descending),
            direction(filter.descending),
        );
        values.push(Value::Integer(sql_count(filter.limit)));
        values.push(Value::Integer(sql_count(filter.offset)));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let subscribers = stmt
            .query_map(params_from_iter(values), Self::row_to_subscriber)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subscribers)
    }

    fn count_subscribers(&self, filter: &SubscriberFilter) -> Result<usize> {
        let (where_clause, values) = Self::subscriber_where(filter);
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM subscribers{}", where_clause),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get_verified_emails(&self, selection: Option<&[String]>) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let (sql, values): (String, Vec<Value>) = match selection {
            Some(selection) => {
                let normalized: Vec<Value> = selection
                    .iter()
                    .map(|e| normalize_email(e))
                    .filter(|e| !e.is_empty())
                    .map(Value::Text)
                    .collect();
                if normalized.is_empty() {
                    return Ok(Vec::new());
                }
                (
                    format!(
                        "SELECT email FROM subscribers WHERE verified = 1 AND email IN ({}) ORDER BY id",
                        placeholders(normalized.len())
                    ),
                    normalized,
                )
            }
            None => (
                "SELECT email FROM subscribers WHERE verified = 1 ORDER BY id".to_string(),
                Vec::new(),
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    fn delete_subscribers(&self, ids: &[i64]) -> Result<usize> {
        self.execute_for_ids("DELETE FROM subscribers WHERE id IN ({ids})", vec![], ids)
    }

    fn set_verified(&self, ids: &[i64], verified: bool) -> Result<usize> {
        self.execute_for_ids(
            "UPDATE subscribers SET verified = ? WHERE id IN ({ids})",
            vec![Value::Integer(verified as i64)],
            ids,
        )
    }

    fn delete_unverified(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM subscribers WHERE verified = 0", [])?)
    }
}

impl EmailQueueStore for SqliteNewsletterStore {
    fn enqueue(&self, email: &NewQueuedEmail) -> Result<i64> {
        let headers = serde_json::to_string(&email.headers)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO email_queue (recipient, subject, body, headers, send_at, sent)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                email.recipient,
                email.subject,
                email.body,
                headers,
                email.send_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_email(&self, id: i64) -> Result<Option<QueuedEmail>> {
        let conn = self.conn.lock().unwrap();
        let email = conn
            .query_row(
                &format!("SELECT {} FROM email_queue WHERE id = ?1", QUEUE_COLUMNS),
                params![id],
                Self::row_to_queued_email,
            )
            .optional()?;
        Ok(email)
    }

    fn count_due(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM email_queue WHERE sent = 0 AND send_at <= ?1",
            params![now],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn fetch_due_batch(&self, now: i64, limit: usize) -> Result<Vec<QueuedEmail>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM email_queue WHERE sent = 0 AND send_at <= ?1 ORDER BY id ASC LIMIT ?2",
            QUEUE_COLUMNS
        ))?;
        let emails = stmt
            .query_map(params![now, sql_count(limit)], Self::row_to_queued_email)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    fn mark_sent(&self, id: i64, sent_at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE email_queue SET sent = 1, sent_at = ?2 WHERE id = ?1",
            params![id, sent_at],
        )?;
        Ok(())
    }

    fn list_queue(&self, filter: &QueueFilter) -> Result<Vec<QueuedEmail>> {
        let sql = format!(
            "SELECT {} FROM email_queue{} ORDER BY {} {}, id {} LIMIT ?1 OFFSET ?2",
            QUEUE_COLUMNS,
            Self::queue_where(filter.status),
            filter.order_by.column(),
            direction(filter.descending),
            direction(filter.descending),
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let emails = stmt
            .query_map(
                params![sql_count(filter.limit), sql_count(filter.offset)],
                Self::row_to_queued_email,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    fn count_queue(&self, status: Option<QueueStatusFilter>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM email_queue{}", Self::queue_where(status)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn queue_stats(&self, now: i64) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN sent = 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN sent = 0 AND send_at <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN sent = 1 THEN 1 ELSE 0 END), 0)
             FROM email_queue",
            params![now],
            |row| {
                Ok(QueueStats {
                    total: row.get::<_, i64>(0)? as usize,
                    pending: row.get::<_, i64>(1)? as usize,
                    due: row.get::<_, i64>(2)? as usize,
                    sent: row.get::<_, i64>(3)? as usize,
                })
            },
        )?;
        Ok(stats)
    }

    fn delete_emails(&self, ids: &[i64]) -> Result<usize> {
        self.execute_for_ids("DELETE FROM email_queue WHERE id IN ({ids})", vec![], ids)
    }

    fn resend_emails(&self, ids: &[i64], now: i64) -> Result<usize> {
        self.execute_for_ids(
            "UPDATE email_queue SET sent = 0, sent_at = NULL, send_at = ? WHERE id IN ({ids})",
            vec![Value::Integer(now)],
            ids,
        )
    }

    fn delete_pending(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM email_queue WHERE sent = 0", [])?)
    }
}

impl DownloadTokenStore for SqliteNewsletterStore {
    fn insert_download_token(&self, token: &NewDownloadToken) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO download_tokens
                (email, token, file_url, post_id, block_id, created_at, expires_at, used, verified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                normalize_email(&token.email),
                token.token,
                token.file_url,
                token.post_id,
                token.block_id,
                token.created_at,
                token.expires_at,
                token.verified
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn find_active_download_token(
        &self,
        token: &str,
        email: &str,
        now: i64,
    ) -> Result<Option<DownloadToken>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM download_tokens
                     WHERE token = ?1 AND email = ?2 AND used = 0 AND expires_at > ?3
                     LIMIT 1",
                    DOWNLOAD_TOKEN_COLUMNS
                ),
                params![token, normalize_email(email), now],
                Self::row_to_download_token,
            )
            .optional()?;
        Ok(row)
    }

    fn mark_download_token_verified(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE download_tokens SET verified = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn mark_download_token_used(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE download_tokens SET used = 1 WHERE id = ?1 AND used = 0",
            params![id],
        )?;
        Ok(changed == 1)
    }

    fn delete_download_tokens_expired_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM download_tokens WHERE expires_at < ?1",
            params![cutoff],
        )?)
    }
}
