pub mod account_db;

pub use account_db::{AccountQuery, AccountStore, SqliteAccountStore};
