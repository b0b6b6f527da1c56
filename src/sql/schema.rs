//! Schema discovery and auto-migration for the SQL destination: make sure
//! the rendered table exists and carries every configured column before an
//! insert is attempted against it.

use sql::{SqlDialect, SqlWorker};

use crypto::digest::Digest;
use crypto::md5::Md5;
use slog::Logger;
use std::sync::Arc;

impl SqlWorker {
    /// Sanitizes the rendered table name and makes sure the table behind it
    /// is usable, creating or altering it as needed. `None` sends the
    /// message into the error path; the worker will retry after the table
    /// problem clears.
    pub(super) fn ensure_accessible_table(
        &mut self,
        log: &Logger,
        rendered_table: &str,
    ) -> Option<String> {
        let table = sanitize_sql_identifier(rendered_table);
        if !self.ensure_table_usable(log, &table) {
            error!(log,
                "Error checking table, disconnecting from database, trying again shortly";
                "table" => table.as_str());
            return None;
        }
        Some(table)
    }

    fn ensure_table_usable(&mut self, log: &Logger, table: &str) -> bool {
        if self.settings.dont_create_tables {
            return true;
        }
        if self.confirmed_tables.contains(table) {
            return true;
        }

        let success = match self.probe_table(log, table) {
            Some(existing_columns) => self.add_missing_columns(log, table, &existing_columns),
            None => self.create_table(log, table) && self.create_all_indexes(log, table),
        };

        if success {
            let _ = self.confirmed_tables.insert(table.to_owned());
        }
        success
    }

    /// Checks for the table in a transaction of its own and reports its
    /// current columns. Quiet about probe failures: a missing table is the
    /// expected outcome on first contact.
    fn probe_table(&mut self, log: &Logger, table: &str) -> Option<Vec<String>> {
        if !self.begin_new_transaction(log) {
            error!(log, "Starting new transaction has failed");
            return None;
        }

        let query = format!("SELECT * FROM {} WHERE 0=1", table);
        let present = self.run_query(log, &query, true);
        let columns = if present {
            match self.client {
                Some(ref mut client) => client.table_columns(table).ok(),
                None => None,
            }
        } else {
            None
        };

        let _ = self.commit_transaction(log);
        columns
    }

    /// Issues an `ALTER TABLE ... ADD` for every configured column the table
    /// is missing, together with any index configured for it. All changes
    /// ride in one transaction.
    fn add_missing_columns(&mut self, log: &Logger, table: &str, existing: &[String]) -> bool {
        let settings = Arc::clone(&self.settings);
        let mut success = true;
        let mut transaction_started = false;

        for field in &settings.fields {
            if existing.iter().any(|column| column == &field.name) {
                continue;
            }

            if !transaction_started {
                if !self.begin_new_transaction(log) {
                    error!(log,
                        "Starting new transaction for modifying(ALTER) table has failed";
                        "table" => table);
                    success = false;
                    break;
                }
                transaction_started = true;
            }

            let query = format!("ALTER TABLE {} ADD {} {}", table, field.name, field.col_type);
            if !self.run_query(log, &query, false) {
                error!(log, "Error adding missing column, giving up";
                    "table" => table,
                    "column" => field.name.as_str());
                success = false;
                break;
            }

            if settings.indexes.iter().any(|index| index == &field.name) {
                let _ = self.create_index(log, table, &field.name);
            }
        }

        if transaction_started && (!success || !self.commit_transaction(log)) {
            let _ = self.rollback_transaction(log);
            success = false;
        }
        success
    }

    fn create_table(&mut self, log: &Logger, table: &str) -> bool {
        let settings = Arc::clone(&self.settings);

        if !self.begin_new_transaction(log) {
            error!(log, "Starting new transaction for table creation has failed";
                "table" => table);
            return false;
        }

        let mut query = format!("CREATE TABLE {} (", table);
        for (i, field) in settings.fields.iter().enumerate() {
            if i > 0 {
                query.push_str(", ");
            }
            query.push_str(&field.name);
            query.push(' ');
            query.push_str(&field.col_type);
        }
        query.push(')');
        if let Some(ref append) = settings.create_statement_append {
            query.push_str(append);
        }

        let mut success = self.run_query(log, &query, false);
        if !success {
            error!(log, "Error creating table, giving up"; "table" => table);
        }
        if !success || !self.commit_transaction(log) {
            let _ = self.rollback_transaction(log);
            success = false;
        }
        success
    }

    fn create_all_indexes(&mut self, log: &Logger, table: &str) -> bool {
        let settings = Arc::clone(&self.settings);

        if !self.begin_new_transaction(log) {
            error!(log, "Starting new transaction for index creation has failed";
                "table" => table);
            return false;
        }

        let mut success = true;
        for column in &settings.indexes {
            success = self.create_index(log, table, column);
            if !success {
                break;
            }
        }

        if !success || !self.commit_transaction(log) {
            let _ = self.rollback_transaction(log);
            success = false;
        }
        success
    }

    fn create_index(&mut self, log: &Logger, table: &str, column: &str) -> bool {
        let name = index_name(self.settings.dialect, table, column);
        let query = format!("CREATE INDEX {} ON {} ({})", name, table, column);
        if !self.run_query(log, &query, false) {
            error!(log, "Error adding missing index";
                "table" => table,
                "column" => column);
            return false;
        }
        true
    }
}

/// Replaces every character outside `[A-Za-z0-9._]` with an underscore.
/// Rendered table names pass through here before reaching any SQL text.
pub(super) fn sanitize_sql_identifier(token: &str) -> String {
    token
        .chars()
        .map(|c| if is_sql_identifier_char(c) { c } else { '_' })
        .collect()
}

pub(super) fn is_sql_identifier_sanitized(token: &str) -> bool {
    !token.is_empty() && token.chars().all(is_sql_identifier_char)
}

//
// Private functions
//

fn is_sql_identifier_char(c: char) -> bool {
    c == '.' || c == '_' || c.is_ascii_digit() || c.is_ascii_alphabetic()
}

/// Index names are `<table>_<column>_idx`, except on Oracle where
/// identifiers are capped at 30 characters: long combinations get the MD5 of
/// `<table>_<column>` in hex, truncated to 30, with the first character
/// forced to `i` so the name cannot start with a digit.
fn index_name(dialect: SqlDialect, table: &str, column: &str) -> String {
    if dialect == SqlDialect::Oracle && table.len() + column.len() > 25 {
        let mut digest = Md5::new();
        digest.input_str(&format!("{}_{}", table, column));
        let hex = digest.result_str();
        format!("i{}", &hex[1..30])
    } else {
        format!("{}_{}_idx", table, column)
    }
}
