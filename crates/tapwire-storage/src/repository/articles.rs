//! Scraped articles repository.

use rusqlite::{params, Connection, Row};

use super::{format_datetime, next_timestamp, parse_datetime};
use crate::error::Result;
use crate::models::{Article, ArticleInsert, NewArticle};

/// Repository for extracted articles.
pub struct ArticlesRepo;

impl ArticlesRepo {
    /// Insert an article unless one with the same `(url, content_hash)` exists.
    ///
    /// Run inside a transaction so the insert and the lookup of an existing id
    /// see the same state.
    pub fn insert_if_absent(conn: &Connection, article: &NewArticle) -> Result<ArticleInsert> {
        let extracted_at = next_timestamp(conn, "scraped_articles", "extracted_at")?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO scraped_articles
                (url, title, content_excerpt, extracted_at, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                article.url,
                article.title,
                article.content_excerpt,
                format_datetime(&extracted_at),
                article.content_hash,
            ],
        )?;

        if inserted == 1 {
            return Ok(ArticleInsert::Inserted(conn.last_insert_rowid()));
        }

        let id: i64 = conn.query_row(
            "SELECT id FROM scraped_articles WHERE url = ?1 AND content_hash = ?2",
            params![article.url, article.content_hash],
            |row| row.get(0),
        )?;

        Ok(ArticleInsert::Existing(id))
    }

    /// Get the newest articles first.
    pub fn get_recent(conn: &Connection, limit: i64) -> Result<Vec<Article>> {
        let mut stmt = conn.prepare(
            "SELECT id, url, title, content_excerpt, extracted_at, content_hash
             FROM scraped_articles ORDER BY id DESC LIMIT ?1",
        )?;

        let articles = stmt
            .query_map([limit], map_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(articles)
    }

    /// Count all articles.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM scraped_articles", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Article> {
    Ok(Article {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        content_excerpt: row.get(3)?,
        extracted_at: parse_datetime(&row.get::<_, String>(4)?),
        content_hash: row.get(5)?,
    })
}
