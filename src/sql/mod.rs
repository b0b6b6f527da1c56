//! The SQL destination: renders each message into an `INSERT` against a
//! per-message table, with optional transactional batching, schema discovery
//! and auto-migration.

use driver::ThreadedDestDriver;
use errors::*;
use message::{Message, Template};
use queue::MessageQueue;
use sql::client::{ConnectParams, DbClient, DbClientFactory, DbError};
use time_helpers;
use worker::{Destination, InsertVerdict, WorkerContext};

use slog::Logger;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub mod client;
mod schema;

/// The database backends the destination knows how to speak to. The dialect
/// decides transaction statements, index naming and connection options; the
/// wire protocol itself is the client factory's business.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SqlDialect {
    MySql,
    PgSql,
    Oracle,
    SqLite,
    SqLite3,
    FreeTds,
}

impl SqlDialect {
    /// `mssql` is accepted as an alias for `freetds`.
    pub fn parse(name: &str) -> Option<SqlDialect> {
        let name = if name == "mssql" { "freetds" } else { name };
        match name {
            "mysql" => Some(SqlDialect::MySql),
            "pgsql" => Some(SqlDialect::PgSql),
            "oracle" => Some(SqlDialect::Oracle),
            "sqlite" => Some(SqlDialect::SqLite),
            "sqlite3" => Some(SqlDialect::SqLite3),
            "freetds" => Some(SqlDialect::FreeTds),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            SqlDialect::MySql => "mysql",
            SqlDialect::PgSql => "pgsql",
            SqlDialect::Oracle => "oracle",
            SqlDialect::SqLite => "sqlite",
            SqlDialect::SqLite3 => "sqlite3",
            SqlDialect::FreeTds => "freetds",
        }
    }
}

/// User-facing configuration for a SQL destination. Plain data; everything
/// is validated when the driver is built.
///
/// `columns` and `values` are parallel lists. A column is either `"name"`
/// (type defaults to `text`) or `"name TYPE"`. A value is a template string,
/// or the sentinel `DEFAULT` to let the column fall back to its SQL default
/// (such columns are left out of the `INSERT` entirely).
pub struct SqlConfig {
    pub db_type:  String,
    pub host:     String,
    pub port:     String,
    pub user:     String,
    pub password: String,
    pub database: String,
    pub encoding: String,

    /// Template producing the destination table name for each message.
    pub table: String,

    pub columns: Vec<String>,
    pub values:  Vec<String>,

    /// Column names to index. Must be a subset of `columns`.
    pub indexes: Vec<String>,

    /// Flag tokens; `-` and `_` spellings are both accepted. Recognized:
    /// `explicit-commits`, `dont-create-tables`. Unknown tokens are logged
    /// and ignored.
    pub flags: Vec<String>,

    /// Batch commit watermark under `explicit-commits`; -1 inherits the
    /// global default.
    pub flush_lines: i32,

    /// Statements run, in order, once per established connection.
    pub session_statements: Vec<String>,

    /// A rendered value equal to this string is emitted as SQL `NULL`.
    pub null_value: Option<String>,

    /// Appended verbatim to generated `CREATE TABLE` statements.
    pub create_statement_append: Option<String>,

    /// Oracle only; warned about and ignored for other backends.
    pub ignore_tns_config: bool,

    /// Client library passthrough options.
    pub dbd_options:         Vec<(String, String)>,
    pub dbd_options_numeric: Vec<(String, i32)>,

    /// Overrides the derived persist name.
    pub persist_name: Option<String>,

    pub time_reopen: Duration,
    pub retries_max: u32,
}

impl Default for SqlConfig {
    fn default() -> SqlConfig {
        SqlConfig {
            db_type:                 "mysql".to_owned(),
            host:                    "".to_owned(),
            port:                    "".to_owned(),
            user:                    "syslog-ng".to_owned(),
            password:                "".to_owned(),
            database:                "logs".to_owned(),
            encoding:                "UTF-8".to_owned(),
            table:                   "messages".to_owned(),
            columns:                 Vec::new(),
            values:                  Vec::new(),
            indexes:                 Vec::new(),
            flags:                   Vec::new(),
            flush_lines:             -1,
            session_statements:      Vec::new(),
            null_value:              None,
            create_statement_append: None,
            ignore_tns_config:       false,
            dbd_options:             Vec::new(),
            dbd_options_numeric:     Vec::new(),
            persist_name:            None,
            time_reopen:             Duration::from_secs(60),
            retries_max:             3,
        }
    }
}

/// The SQL destination driver: a validated configuration plus the threaded
/// destination machinery it feeds callbacks to.
pub struct SqlDestDriver {
    pub dest: ThreadedDestDriver,

    settings: Arc<SqlSettings>,
    factory:  Box<DbClientFactory>,
}

impl SqlDestDriver {
    /// Validates the configuration and prepares the driver. All fatal
    /// configuration problems surface here; a driver that builds will start.
    pub fn new(
        log: &Logger,
        config: SqlConfig,
        factory: Box<DbClientFactory>,
    ) -> Result<SqlDestDriver> {
        client::initialize_library(log);

        let time_reopen = config.time_reopen;
        let retries_max = config.retries_max;
        let settings = SqlSettings::build(log, config)?;

        if !factory.driver_available(settings.dialect) {
            bail!(
                "No usable database driver for type: {}",
                settings.dialect.as_str()
            );
        }

        let mut dest = ThreadedDestDriver::new();
        dest.time_reopen = time_reopen;
        dest.retries_max = retries_max;

        Ok(SqlDestDriver {
            dest:     dest,
            settings: Arc::new(settings),
            factory:  factory,
        })
    }

    pub fn init(&mut self, log: &Logger) -> Result<()> {
        let worker = SqlWorker {
            settings:           Arc::clone(&self.settings),
            factory:            self.factory.clone_box(),
            client:             None,
            transaction_active: false,
            confirmed_tables:   HashSet::new(),
        };
        self.dest.init(log, Box::new(worker))
    }

    pub fn deinit(&mut self, log: &Logger) {
        self.dest.deinit(log);
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        self.dest.queue()
    }
}

//
// Private constants
//

/// Global default for `flush_lines` when the configuration inherits it.
const DEFAULT_FLUSH_LINES: usize = 100;

//
// Private types
//

/// One configured column: its name, its SQL type, and the template producing
/// its value. A `None` value is the `DEFAULT` sentinel.
struct SqlField {
    name:     String,
    col_type: String,
    value:    Option<Template>,
}

/// The validated, immutable form of `SqlConfig` shared between the driver
/// and its worker.
struct SqlSettings {
    dialect:                 SqlDialect,
    host:                    String,
    port:                    String,
    user:                    String,
    password:                String,
    database:                String,
    encoding:                String,
    table:                   Template,
    fields:                  Vec<SqlField>,
    indexes:                 Vec<String>,
    explicit_commits:        bool,
    dont_create_tables:      bool,
    flush_lines:             usize,
    session_statements:      Vec<String>,
    null_value:              Option<String>,
    create_statement_append: Option<String>,
    ignore_tns_config:       bool,
    dbd_options:             Vec<(String, String)>,
    dbd_options_numeric:     Vec<(String, i32)>,
    persist_name_override:   Option<String>,
}

impl SqlSettings {
    fn build(log: &Logger, config: SqlConfig) -> Result<SqlSettings> {
        let dialect = SqlDialect::parse(&config.db_type)
            .ok_or_else(|| Error::from(format!("Unknown database type: {}", config.db_type)))?;

        if !config.port.is_empty() && !config.port.chars().all(|c| c.is_ascii_digit()) {
            bail!("Illegal SQL port number: {}", config.port);
        }

        if config.columns.is_empty() || config.values.is_empty() {
            bail!("Columns and values must be specified for database destinations");
        }
        if config.columns.len() != config.values.len() {
            bail!(
                "The number of columns and values do not match: {} columns, {} values",
                config.columns.len(),
                config.values.len()
            );
        }

        let mut fields = Vec::with_capacity(config.columns.len());
        for (column, value) in config.columns.iter().zip(config.values.iter()) {
            fields.push(parse_field(column, value)?);
        }

        let (explicit_commits, dont_create_tables) = parse_flags(log, &config.flags);

        if config.ignore_tns_config && dialect != SqlDialect::Oracle {
            warn!(log,
                "Option ignore_tns_config was skipped because database type is not Oracle";
                "type" => dialect.as_str());
        }

        let flush_lines = if config.flush_lines < 0 {
            DEFAULT_FLUSH_LINES
        } else {
            config.flush_lines as usize
        };

        Ok(SqlSettings {
            dialect:                 dialect,
            host:                    config.host,
            port:                    config.port,
            user:                    config.user,
            password:                config.password,
            database:                config.database,
            encoding:                config.encoding,
            table:                   Template::compile(&config.table),
            fields:                  fields,
            indexes:                 config.indexes,
            explicit_commits:        explicit_commits,
            dont_create_tables:      dont_create_tables,
            flush_lines:             flush_lines,
            session_statements:      config.session_statements,
            null_value:              config.null_value,
            create_statement_append: config.create_statement_append,
            ignore_tns_config:       config.ignore_tns_config,
            dbd_options:             config.dbd_options,
            dbd_options_numeric:     config.dbd_options_numeric,
            persist_name_override:   config.persist_name,
        })
    }

    fn stats_instance(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.dialect.as_str(),
            self.host,
            self.port,
            self.database,
            self.table.source()
        )
    }

    fn persist_name(&self) -> String {
        match self.persist_name_override {
            Some(ref name) => format!("afsql_dd.{}", name),
            None => format!(
                "afsql_dd({},{},{},{},{})",
                self.dialect.as_str(),
                self.host,
                self.port,
                self.database,
                self.table.source()
            ),
        }
    }

    fn connect_params(&self) -> ConnectParams {
        let mut params = ConnectParams::new(self.dialect);
        params.set_option("host", &self.host);
        // MySQL's client library insists on a numeric port option; everyone
        // else takes a string.
        if self.dialect == SqlDialect::MySql {
            params.set_option_numeric("port", self.port.parse().unwrap_or(0));
        } else {
            params.set_option("port", &self.port);
        }
        params.set_option("username", &self.user);
        params.set_option("password", &self.password);
        params.set_option("dbname", &self.database);
        params.set_option("encoding", &self.encoding);
        params.set_option(
            "auto-commit",
            if self.explicit_commits { "false" } else { "true" },
        );

        // SQLite backends would otherwise resolve the database relative to
        // a library-chosen directory.
        params.set_option("sqlite_dbdir", "");
        params.set_option("sqlite3_dbdir", "");

        if self.dialect == SqlDialect::Oracle {
            params.set_option_numeric("oracle_ignore_tns_config", self.ignore_tns_config as i32);
        }

        for &(ref name, ref value) in &self.dbd_options {
            params.set_option(name, value);
        }
        for &(ref name, value) in &self.dbd_options_numeric {
            params.set_option_numeric(name, value);
        }
        params
    }
}

/// The worker side of the SQL destination. Owned by the worker thread; the
/// client handle, the transaction flag and the set of tables already
/// verified this session all live here.
struct SqlWorker {
    settings:           Arc<SqlSettings>,
    factory:            Box<DbClientFactory>,
    client:             Option<Box<DbClient>>,
    transaction_active: bool,
    confirmed_tables:   HashSet<String>,
}

impl SqlWorker {
    /// Runs a query, logging it at debug level first. With `silent` set a
    /// failure is reported only through the return value; the table probe
    /// uses this since a missing table is an expected outcome.
    fn run_query(&mut self, log: &Logger, query: &str, silent: bool) -> bool {
        debug!(log, "Running SQL query"; "query" => query);

        let result = match self.client {
            Some(ref mut client) => client.execute(query),
            None => Err(DbError {
                message: "not connected".to_owned(),
            }),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                if !silent {
                    error!(log, "Error running SQL query";
                        "type" => self.settings.dialect.as_str(),
                        "host" => self.settings.host.as_str(),
                        "port" => self.settings.port.as_str(),
                        "user" => self.settings.user.as_str(),
                        "database" => self.settings.database.as_str(),
                        "error" => e.to_string(),
                        "query" => query);
                }
                false
            }
        }
    }

    //
    // Transaction handling
    //

    fn begin_transaction(&mut self, log: &Logger) -> bool {
        let dialect = self.settings.dialect;
        let success = match dialect {
            // Oracle starts a transaction implicitly after every commit.
            SqlDialect::Oracle => true,
            SqlDialect::FreeTds => self.run_query(log, "BEGIN TRANSACTION", false),
            _ => self.run_query(log, "BEGIN", false),
        };
        self.transaction_active = success;
        success
    }

    fn commit_transaction(&mut self, log: &Logger) -> bool {
        if !self.transaction_active {
            return true;
        }
        let success = self.run_query(log, "COMMIT", false);
        if success {
            self.transaction_active = false;
        } else {
            error!(log, "SQL transaction commit failed, rewinding backlog and starting again");
        }
        success
    }

    fn rollback_transaction(&mut self, log: &Logger) -> bool {
        if !self.transaction_active {
            return true;
        }
        self.transaction_active = false;
        self.run_query(log, "ROLLBACK", false)
    }

    fn begin_new_transaction(&mut self, log: &Logger) -> bool {
        if self.transaction_active {
            if !self.commit_transaction(log) {
                let _ = self.rollback_transaction(log);
                return false;
            }
        }
        self.begin_transaction(log)
    }

    fn should_begin_new_transaction(&self, ctx: &WorkerContext) -> bool {
        self.settings.explicit_commits && ctx.batch_size() == 0
    }

    fn should_commit_transaction(&self, ctx: &WorkerContext) -> bool {
        self.settings.explicit_commits && ctx.batch_size() + 1 >= self.settings.flush_lines
    }

    //
    // Insert plumbing
    //

    fn build_insert_command(&self, msg: &Message, seq_num: u64, table: &str) -> String {
        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        for field in &self.settings.fields {
            let template = match field.value {
                Some(ref template) => template,
                None => continue,
            };
            columns.push(field.name.as_str());

            let rendered = template.render(msg, seq_num);
            let is_null = self
                .settings
                .null_value
                .as_ref()
                .map(|null_value| *null_value == rendered)
                .unwrap_or(false);
            values.push(if is_null {
                "NULL".to_owned()
            } else {
                self.quote(&rendered)
            });
        }

        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            values.join(", ")
        )
    }

    fn quote(&self, value: &str) -> String {
        match self.client {
            Some(ref client) => client.quote_string(value),
            None => client::quote_string(value),
        }
    }

    /// Maps a failed insert to a verdict by checking whether the server is
    /// still there: a live server means the statement itself was bad
    /// (bounded retry), a dead one means reconnect-and-replay.
    fn insert_failed_verdict(&mut self, log: &Logger) -> InsertVerdict {
        let alive = match self.client {
            Some(ref mut client) => client.ping(),
            None => false,
        };
        if alive {
            return InsertVerdict::Error;
        }

        if self.settings.explicit_commits {
            error!(log, "SQL connection lost in the middle of a transaction, rewinding backlog and starting again");
        } else {
            error!(log, "Error, no SQL connection after failed query attempt");
        }
        InsertVerdict::NotConnected
    }

    fn flush_verdict(&mut self, log: &Logger) -> InsertVerdict {
        if !self.commit_transaction(log) {
            let _ = self.rollback_transaction(log);
            return InsertVerdict::Error;
        }
        InsertVerdict::Success
    }
}

impl Destination for SqlWorker {
    fn persist_name(&self) -> String {
        self.settings.persist_name()
    }

    fn stats_instance(&self) -> String {
        self.settings.stats_instance()
    }

    fn connect(&mut self, log: &Logger) -> bool {
        let settings = Arc::clone(&self.settings);
        let params = settings.connect_params();

        let client = {
            let create_log = log.new(o!("step" => "connect_sql"));
            match time_helpers::log_timed(&create_log, |log| self.factory.create(log, &params)) {
                Ok(client) => client,
                Err(e) => {
                    error!(log, "Error establishing SQL connection";
                        "type" => settings.dialect.as_str(),
                        "host" => settings.host.as_str(),
                        "port" => settings.port.as_str(),
                        "user" => settings.user.as_str(),
                        "database" => settings.database.as_str(),
                        "error" => e.to_string());
                    return false;
                }
            }
        };
        self.client = Some(client);

        for statement in &settings.session_statements {
            if !self.run_query(log, statement, false) {
                error!(log, "Error executing SQL connection statement";
                    "statement" => statement.as_str());
                self.client = None;
                return false;
            }
        }

        true
    }

    fn disconnect(&mut self, _log: &Logger) {
        self.client = None;
        self.transaction_active = false;
    }

    fn insert(&mut self, log: &Logger, ctx: &WorkerContext, msg: &Message) -> InsertVerdict {
        let settings = Arc::clone(&self.settings);

        let rendered_table = settings.table.render(msg, ctx.seq_num());
        let table = match self.ensure_accessible_table(log, &rendered_table) {
            Some(table) => table,
            None => return InsertVerdict::Error,
        };

        if self.should_begin_new_transaction(ctx) && !self.begin_transaction(log) {
            return InsertVerdict::Error;
        }

        let insert_command = self.build_insert_command(msg, ctx.seq_num(), &table);
        if !self.run_query(log, &insert_command, false) {
            return self.insert_failed_verdict(log);
        }

        if self.should_commit_transaction(ctx) {
            self.flush_verdict(log)
        } else if settings.explicit_commits {
            InsertVerdict::Queued
        } else {
            InsertVerdict::Success
        }
    }

    fn flush(&mut self, log: &Logger, _ctx: &WorkerContext) -> InsertVerdict {
        self.flush_verdict(log)
    }
}

//
// Private functions
//

fn parse_field(column: &str, value: &str) -> Result<SqlField> {
    let (name, col_type) = match column.find(' ') {
        Some(idx) => {
            let col_type = column[idx..].trim_start();
            (
                &column[..idx],
                if col_type.is_empty() { "text" } else { col_type },
            )
        }
        None => (column, "text"),
    };

    if !schema::is_sql_identifier_sanitized(name) {
        bail!("Column name is not a proper SQL name: {}", name);
    }

    Ok(SqlField {
        name:     name.to_owned(),
        col_type: col_type.to_owned(),
        value:    if value == "DEFAULT" {
            None
        } else {
            Some(Template::compile(value))
        },
    })
}

fn parse_flags(log: &Logger, flags: &[String]) -> (bool, bool) {
    let mut explicit_commits = false;
    let mut dont_create_tables = false;
    for flag in flags {
        match flag.as_str() {
            "explicit-commits" | "explicit_commits" => explicit_commits = true,
            "dont-create-tables" | "dont_create_tables" => dont_create_tables = true,
            other => warn!(log, "Unknown SQL flag"; "flag" => other),
        }
    }
    (explicit_commits, dont_create_tables)
}
