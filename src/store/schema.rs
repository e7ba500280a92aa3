use std::{fs, path::Path};

use rusqlite::Connection;

use crate::error::{StoreError, StoreResult};

pub fn open_connection(path: &Path) -> StoreResult<Connection> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|err| StoreError::Unavailable(format!("{}: {err}", dir.display())))?;
    }
    Ok(Connection::open(path)?)
}

pub fn init_db(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS apartments (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          number TEXT NOT NULL,
          floor INTEGER NOT NULL,
          resident_name TEXT NOT NULL,
          resident_cin TEXT,
          occupancy_type TEXT NOT NULL,
          roommates_data TEXT NOT NULL DEFAULT '[]',
          status TEXT NOT NULL,
          monthly_total TEXT,
          balance TEXT NOT NULL DEFAULT '0',
          email TEXT,
          phone TEXT
        );
        CREATE TABLE IF NOT EXISTS payments (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          apartment_id INTEGER NOT NULL,
          year INTEGER NOT NULL,
          month INTEGER NOT NULL CHECK (month BETWEEN 1 AND 12),
          amount TEXT NOT NULL,
          status TEXT NOT NULL,
          paid_ts_utc INTEGER,
          created_ts_utc INTEGER NOT NULL,
          UNIQUE (apartment_id, month, year)
        );
        CREATE TABLE IF NOT EXISTS expenses (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          category TEXT NOT NULL,
          amount TEXT NOT NULL,
          description TEXT NOT NULL,
          date_local TEXT NOT NULL,
          created_ts_utc INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS settings (
          id TEXT PRIMARY KEY CHECK (id = 'app'),
          building_name TEXT NOT NULL,
          building_address TEXT NOT NULL,
          default_monthly_fee TEXT NOT NULL,
          currency TEXT NOT NULL,
          updated_ts_utc INTEGER NOT NULL,
          updated_by TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS profiles (
          id TEXT PRIMARY KEY,
          email TEXT NOT NULL,
          display_name TEXT NOT NULL,
          role TEXT NOT NULL,
          created_ts_utc INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS identities (
          id TEXT PRIMARY KEY,
          email TEXT NOT NULL UNIQUE,
          password_hash TEXT NOT NULL,
          created_ts_utc INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS payments_by_year ON payments (year);
        CREATE INDEX IF NOT EXISTS expenses_by_date ON expenses (date_local);",
    )?;
    Ok(())
}
