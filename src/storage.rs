use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous}, Row};

use crate::book::{Book, NewBook};
use crate::conversation::EntityLookup;
use crate::error::{CatalogError, LookupError};

pub const PAGE_SIZE: u32 = 5;

/// One page of results, newest first.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page<T> {
    pub count: i64,
    pub next: Option<u32>,
    pub previous: Option<u32>,
    pub results: Vec<T>,
}

#[async_trait]
pub trait BookRepository: Send + Sync {
    async fn add_book(&self, book: NewBook) -> Result<Book, CatalogError>;
    async fn get_book(&self, id: i64) -> Result<Option<Book>, CatalogError>;
    async fn list_books(&self, page: u32) -> Result<Page<Book>, CatalogError>;
}

#[derive(Clone)]
pub struct SqliteBookRepository {
    pool: Pool<Sqlite>,
}

impl SqliteBookRepository {
    pub async fn initialize(database_url: Option<String>) -> Result<Self, CatalogError> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url().map_err(|e| CatalogError::Database(sqlx::Error::Io(e)))?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> std::io::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("bookchat");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("bookchat.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn book_from_row(r: &SqliteRow) -> Book {
    Book {
        id: r.get("id"),
        book_name: r.get("book_name"),
        author_name: r.get("author_name"),
        isbn: r.get("isbn"),
        price: r.get("price"),
        quantity: r.get("quantity"),
        description: r.get("description"),
    }
}

#[async_trait]
impl BookRepository for SqliteBookRepository {
    async fn add_book(&self, book: NewBook) -> Result<Book, CatalogError> {
        let book = book.validate().map_err(CatalogError::Validation)?;
        let res = sqlx::query("INSERT INTO books (book_name, author_name, isbn, price, quantity, description, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)")
            .bind(&book.book_name)
            .bind(&book.author_name)
            .bind(&book.isbn)
            .bind(book.price)
            .bind(book.quantity)
            .bind(&book.description)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await;
        let res = match res {
            Ok(r) => r,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(CatalogError::DuplicateIsbn(book.isbn));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(book.into_book(res.last_insert_rowid()))
    }

    async fn get_book(&self, id: i64) -> Result<Option<Book>, CatalogError> {
        let row = sqlx::query("SELECT id, book_name, author_name, isbn, price, quantity, description FROM books WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(book_from_row))
    }

    async fn list_books(&self, page: u32) -> Result<Page<Book>, CatalogError> {
        if page == 0 {
            return Err(CatalogError::InvalidPage(page));
        }
        let count: i64 = sqlx::query("SELECT count(*) AS c FROM books")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let pages = ((count + PAGE_SIZE as i64 - 1) / PAGE_SIZE as i64).max(1);
        if page as i64 > pages {
            return Err(CatalogError::InvalidPage(page));
        }
        let rows = sqlx::query("SELECT id, book_name, author_name, isbn, price, quantity, description FROM books ORDER BY id DESC LIMIT ?1 OFFSET ?2")
            .bind(PAGE_SIZE as i64)
            .bind(((page - 1) * PAGE_SIZE) as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(Page {
            count,
            next: ((page as i64) < pages).then_some(page + 1),
            previous: (page > 1).then(|| page - 1),
            results: rows.iter().map(book_from_row).collect(),
        })
    }
}

#[async_trait]
impl EntityLookup for SqliteBookRepository {
    async fn lookup(&self, id: &str) -> Result<Book, LookupError> {
        let id: i64 = id.trim().parse().map_err(|_| LookupError::NotFound)?;
        match self.get_book(id).await {
            Ok(Some(book)) => Ok(book),
            Ok(None) => Err(LookupError::NotFound),
            Err(e) => Err(LookupError::Failed(e.to_string())),
        }
    }
}
