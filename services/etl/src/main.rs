//! ETL Service - Transforms the IDA spreadsheets and loads the star schema
//!
//! Responsibilities:
//! - Read each .ods file collected under DATA_DIR (string-typed cells,
//!   fixed-size preamble skipped)
//! - Reshape the wide month-per-column layout into long format
//! - Coerce pt-BR numeric values and normalize month tokens to YYYY-MM
//! - Unify all files into one long table tagged with its service code
//! - Append new business keys into the dimension tables (never duplicating)
//! - Resolve business keys to surrogate ids and rebuild fato_indicadores
//!   as a transactional full replace
//! - Apply the optional views script afterwards
//!
//! Failure containment: a broken file or a failed dimension load is reported
//! and the rest of the run proceeds. Only connectivity and setup failures
//! abort the run. Rows that cannot be parsed or resolved are dropped at fact
//! build time with per-reason counts.

use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads IDA spreadsheets into the star schema")]
struct Args {
    /// Path to sources config file
    #[arg(long, default_value = "config/sources.json")]
    config: String,

    /// Directory holding the collected spreadsheets (overrides DATA_DIR)
    #[arg(long)]
    data_dir: Option<String>,

    /// Dry run - transform and report, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Path to the post-load views script
    #[arg(long, default_value = "postgres/views.sql")]
    views_sql: String,

    /// Skip the post-load views script
    #[arg(long, default_value = "false")]
    skip_views: bool,
}

// =============================================================================
// Configuration
// =============================================================================

/// Database and input-directory settings, read from the environment:
/// - DB_HOST (default: localhost)
/// - DB_PORT (default: 5432)
/// - DB_USER (default: postgres)
/// - DB_PASS (default: postgres)
/// - DB_NAME (default: anatel_indicadores)
/// - DATA_DIR (default: ./data/raw)
#[derive(Debug, Clone)]
struct Config {
    db_host: String,
    db_port: u16,
    db_user: String,
    db_pass: String,
    db_name: String,
    data_dir: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            db_port: std::env::var("DB_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .context("DB_PORT must be a port number")?,
            db_user: std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            db_pass: std::env::var("DB_PASS").unwrap_or_else(|_| "postgres".to_string()),
            db_name: std::env::var("DB_NAME")
                .unwrap_or_else(|_| "anatel_indicadores".to_string()),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
        })
    }

    fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_pass, self.db_host, self.db_port, self.db_name
        )
    }
}

// =============================================================================
// Source Configuration Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SourcesConfig {
    version: String,
    sources: Vec<SourceSpec>,
}

/// One spreadsheet and the service code its rows are tagged with.
#[derive(Debug, Deserialize)]
struct SourceSpec {
    file: String,
    service: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Load sources configuration from JSON file
async fn load_sources_config(path: &str) -> Result<SourcesConfig> {
    let content = fs::read_to_string(path)
        .await
        .context("Failed to read sources config")?;
    let config: SourcesConfig =
        serde_json::from_str(&content).context("Failed to parse sources config")?;

    for source in &config.sources {
        if source.file.is_empty() || source.service.is_empty() {
            bail!("sources config entry missing file name or service code");
        }
    }

    Ok(config)
}

// =============================================================================
// SPREADSHEET READER
// =============================================================================

/// Rows of preamble (title, notes, blank lines) above the column labels in
/// every IDA spreadsheet.
const HEADER_ROWS: usize = 8;

/// One worksheet with string-typed cells. `None` marks an empty cell.
#[derive(Debug)]
struct RawSheet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

fn header_cell(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => format!("{}", other),
    }
}

fn data_cell(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Data::Float(f) => Some(f.to_string()),
        Data::Int(i) => Some(i.to_string()),
        other => Some(format!("{}", other)),
    }
}

/// Read the first worksheet of a spreadsheet into string-typed cells,
/// skipping the preamble block. The first row after the preamble carries the
/// column labels.
fn read_sheet(path: &Path) -> Result<RawSheet> {
    let mut workbook = open_workbook_auto(path).context("Failed to open spreadsheet")?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names.first().context("Spreadsheet has no sheets")?;

    let range = workbook
        .worksheet_range(sheet_name)
        .context("Failed to read sheet")?;

    let (row_count, col_count) = range.get_size();
    println!(
        "  Sheet '{}': {} rows x {} columns",
        sheet_name, row_count, col_count
    );

    let mut rows = range.rows().skip(HEADER_ROWS);
    let header = rows
        .next()
        .context("No label row after the preamble block")?;
    let columns: Vec<String> = header.iter().map(header_cell).collect();

    let width = columns.len();
    let data = rows
        .map(|row| {
            let mut cells: Vec<Option<String>> = row.iter().map(data_cell).collect();
            cells.resize(width, None);
            cells
        })
        .collect();

    Ok(RawSheet {
        columns,
        rows: data,
    })
}

// =============================================================================
// SHAPE NORMALIZER
// =============================================================================

/// Month abbreviations as they appear in the column labels (pt-BR).
const MONTH_ABBREVS: [&str; 12] = [
    "jan", "fev", "mar", "abr", "mai", "jun", "jul", "ago", "set", "out", "nov", "dez",
];

/// One melted observation: identifier values plus one month cell.
#[derive(Debug, Clone, PartialEq)]
struct ReshapedRow {
    company: String,
    metric: String,
    month_label: String,
    raw_value: Option<String>,
}

fn normalize_label(label: &str) -> String {
    label.replace('\n', " ").trim().to_string()
}

/// A value column carries a month label: either a month-abbreviation prefix
/// ("Jan-19") or a dashed date-range form ("2019-01").
fn is_value_label(label: &str) -> bool {
    let lower = label.to_lowercase();
    MONTH_ABBREVS.iter().any(|m| lower.starts_with(m)) || lower.contains('-')
}

/// Melt a wide sheet into long form. The first two surviving columns are the
/// identifiers (company group, metric name); later columns with month labels
/// are the values. Rows without any value cell are spreadsheet padding and
/// rows missing an identifier cell can never resolve to a dimension key, so
/// both are dropped here.
fn reshape(sheet: &RawSheet) -> Result<Vec<ReshapedRow>> {
    // Columns with no data at all (spacer columns) are dropped first
    let kept: Vec<usize> = (0..sheet.columns.len())
        .filter(|&idx| sheet.rows.iter().any(|row| row[idx].is_some()))
        .collect();

    if kept.len() < 2 {
        bail!("identifier columns missing (only {} non-empty columns)", kept.len());
    }

    let labels: Vec<String> = kept
        .iter()
        .map(|&idx| normalize_label(&sheet.columns[idx]))
        .collect();

    let (company_col, metric_col) = (kept[0], kept[1]);
    let value_cols: Vec<(usize, &String)> = kept[2..]
        .iter()
        .zip(labels[2..].iter())
        .filter(|(_, label)| is_value_label(label))
        .map(|(&idx, label)| (idx, label))
        .collect();

    if value_cols.is_empty() {
        bail!("no month-labeled value columns found");
    }

    println!(
        "  Identifier columns: '{}', '{}'; value columns: {}",
        labels[0],
        labels[1],
        value_cols.len()
    );

    let mut reshaped = Vec::new();
    let mut padding_rows = 0;
    let mut unidentified_rows = 0;

    for row in &sheet.rows {
        if value_cols.iter().all(|&(idx, _)| row[idx].is_none()) {
            padding_rows += 1;
            continue;
        }

        let (company, metric) = match (&row[company_col], &row[metric_col]) {
            (Some(company), Some(metric)) => (company, metric),
            _ => {
                unidentified_rows += 1;
                continue;
            }
        };

        for &(idx, label) in &value_cols {
            reshaped.push(ReshapedRow {
                company: company.clone(),
                metric: metric.clone(),
                month_label: label.clone(),
                raw_value: row[idx].clone(),
            });
        }
    }

    if padding_rows + unidentified_rows > 0 {
        println!(
            "  Dropped {} padding row(s), {} row(s) without identifiers",
            padding_rows, unidentified_rows
        );
    }

    Ok(reshaped)
}

// =============================================================================
// VALUE COERCER
// =============================================================================

/// A validated calendar month. Construction is the only path in, so every
/// MonthKey renders as a well-formed YYYY-MM key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct MonthKey {
    year: i32,
    month: u32,
}

impl MonthKey {
    fn new(year: i32, month: u32) -> Option<Self> {
        if !(1..=12).contains(&month) || !(1900..=2100).contains(&year) {
            return None;
        }
        Some(Self { year, month })
    }

    /// First day of the month, the business key of dim_tempo.
    fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("month validated at construction")
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Parse a month label into a MonthKey. Accepted forms (after lowercasing
/// and `/` -> `-`): "jan-19", "jan-2019", "2019-01", "01-2019", "201901".
/// Anything else is an invalid month and the row is dropped downstream.
fn parse_month_label(label: &str) -> Option<MonthKey> {
    let norm = label.trim().to_lowercase().replace('/', "-");

    if let Some(pos) = MONTH_ABBREVS.iter().position(|m| norm.starts_with(m)) {
        let digits: String = norm.chars().filter(|c| c.is_ascii_digit()).collect();
        let year = match digits.len() {
            2 => 2000 + digits.parse::<i32>().ok()?,
            4 => digits.parse::<i32>().ok()?,
            _ => return None,
        };
        return MonthKey::new(year, pos as u32 + 1);
    }

    let parts: Vec<&str> = norm
        .split('-')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [year, month] if year.len() == 4 && month.len() == 2 => {
            MonthKey::new(year.parse().ok()?, month.parse().ok()?)
        }
        [month, year] if month.len() == 2 && year.len() == 4 => {
            MonthKey::new(year.parse().ok()?, month.parse().ok()?)
        }
        [token] if token.len() == 6 => {
            MonthKey::new(token[..4].parse().ok()?, token[4..].parse().ok()?)
        }
        _ => None,
    }
}

/// Parse a numeric cell under the pt-BR convention: "," is the decimal
/// separator and "." groups thousands. Values are rounded to 3 decimal
/// places; unparseable text is None, never an error.
fn parse_decimal(raw: &str) -> Option<f64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let normalized = if text.contains(',') {
        text.replace('.', "").replace(',', ".")
    } else {
        text.to_string()
    };

    let value: f64 = normalized.parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    Some((value * 1000.0).round() / 1000.0)
}

/// One long-format observation before dataset tagging.
#[derive(Debug, Clone, PartialEq)]
struct CoercedRow {
    company: String,
    metric: String,
    month: Option<MonthKey>,
    value: Option<f64>,
}

fn coerce(rows: Vec<ReshapedRow>) -> Vec<CoercedRow> {
    rows.into_iter()
        .map(|row| CoercedRow {
            month: parse_month_label(&row.month_label),
            value: row.raw_value.as_deref().and_then(parse_decimal),
            company: row.company,
            metric: row.metric,
        })
        .collect()
}

/// Read, reshape and coerce one spreadsheet.
fn process_file(path: &Path) -> Result<Vec<CoercedRow>> {
    let sheet = read_sheet(path)?;
    let reshaped = reshape(&sheet)?;
    Ok(coerce(reshaped))
}

// =============================================================================
// DATASET UNIFIER
// =============================================================================

/// One unified observation. `service` is the dataset origin, set here once
/// from the configured mapping and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
struct LongRow {
    company: String,
    metric: String,
    month: Option<MonthKey>,
    value: Option<f64>,
    service: String,
}

fn unify(batches: Vec<(String, Vec<CoercedRow>)>) -> Vec<LongRow> {
    let mut unified = Vec::new();
    for (service, rows) in batches {
        for row in rows {
            unified.push(LongRow {
                company: row.company,
                metric: row.metric,
                month: row.month,
                value: row.value,
                service: service.clone(),
            });
        }
    }
    unified
}

// =============================================================================
// SCHEMA
// =============================================================================

/// Star schema. Dimension tables are additive across runs and are never
/// dropped or truncated; the fact table is rebuilt wholesale each run.
const SCHEMA_SQL: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS dim_empresa (
        id_empresa SERIAL PRIMARY KEY,
        nome TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS dim_variavel (
        id_variavel SERIAL PRIMARY KEY,
        nome_variavel TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS dim_servico (
        id_servico SERIAL PRIMARY KEY,
        sigla TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS dim_tempo (
        id_tempo SERIAL PRIMARY KEY,
        mes DATE NOT NULL UNIQUE,
        ano INT NOT NULL,
        mes_num INT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS fato_indicadores (
        id_empresa INT NOT NULL REFERENCES dim_empresa (id_empresa),
        id_variavel INT NOT NULL REFERENCES dim_variavel (id_variavel),
        id_servico INT NOT NULL REFERENCES dim_servico (id_servico),
        id_tempo INT NOT NULL REFERENCES dim_tempo (id_tempo),
        valor DOUBLE PRECISION NOT NULL
    )",
];

async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA_SQL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

// =============================================================================
// DIMENSION LOADER
// =============================================================================

fn distinct_companies(rows: &[LongRow]) -> BTreeSet<String> {
    rows.iter().map(|r| r.company.clone()).collect()
}

fn distinct_metrics(rows: &[LongRow]) -> BTreeSet<String> {
    rows.iter().map(|r| r.metric.clone()).collect()
}

fn distinct_services(rows: &[LongRow]) -> BTreeSet<String> {
    rows.iter().map(|r| r.service.clone()).collect()
}

/// Distinct valid months; rows with an invalid month contribute nothing.
fn distinct_months(rows: &[LongRow]) -> BTreeSet<MonthKey> {
    rows.iter().filter_map(|r| r.month).collect()
}

fn keys_to_insert<'a>(
    wanted: &'a BTreeSet<String>,
    existing: &HashSet<String>,
) -> Vec<&'a String> {
    wanted.iter().filter(|key| !existing.contains(*key)).collect()
}

/// Append business keys that are not yet stored; existing keys are left
/// untouched, so re-running over the same data inserts nothing.
async fn insert_missing_keys(
    pool: &PgPool,
    table: &str,
    key_column: &str,
    keys: &BTreeSet<String>,
) -> Result<usize> {
    let existing: Vec<(String,)> =
        sqlx::query_as(&format!("SELECT {} FROM {}", key_column, table))
            .fetch_all(pool)
            .await?;
    let existing: HashSet<String> = existing.into_iter().map(|(key,)| key).collect();

    let insert = format!("INSERT INTO {} ({}) VALUES ($1)", table, key_column);
    let missing = keys_to_insert(keys, &existing);
    for key in &missing {
        sqlx::query(&insert).bind(key).execute(pool).await?;
    }

    Ok(missing.len())
}

/// dim_tempo stores the calendar month plus its ano / mes_num attributes.
async fn load_dim_tempo(pool: &PgPool, months: &BTreeSet<MonthKey>) -> Result<usize> {
    let existing: Vec<(NaiveDate,)> = sqlx::query_as("SELECT mes FROM dim_tempo")
        .fetch_all(pool)
        .await?;
    let existing: HashSet<NaiveDate> = existing.into_iter().map(|(mes,)| mes).collect();

    let mut inserted = 0;
    for month in months {
        let mes = month.first_day();
        if existing.contains(&mes) {
            continue;
        }
        sqlx::query("INSERT INTO dim_tempo (mes, ano, mes_num) VALUES ($1, $2, $3)")
            .bind(mes)
            .bind(month.year)
            .bind(month.month as i32)
            .execute(pool)
            .await?;
        inserted += 1;
    }

    Ok(inserted)
}

/// Load all four dimensions. Each load is independent: a failure is reported
/// with its table name and the remaining dimensions still proceed.
async fn load_dimensions(pool: &PgPool, rows: &[LongRow]) {
    match insert_missing_keys(pool, "dim_empresa", "nome", &distinct_companies(rows)).await {
        Ok(n) => println!("  ✓ dim_empresa: {} new key(s)", n),
        Err(e) => eprintln!("  ✗ dim_empresa failed: {:#}", e),
    }

    match insert_missing_keys(pool, "dim_variavel", "nome_variavel", &distinct_metrics(rows)).await
    {
        Ok(n) => println!("  ✓ dim_variavel: {} new key(s)", n),
        Err(e) => eprintln!("  ✗ dim_variavel failed: {:#}", e),
    }

    match insert_missing_keys(pool, "dim_servico", "sigla", &distinct_services(rows)).await {
        Ok(n) => println!("  ✓ dim_servico: {} new key(s)", n),
        Err(e) => eprintln!("  ✗ dim_servico failed: {:#}", e),
    }

    match load_dim_tempo(pool, &distinct_months(rows)).await {
        Ok(n) => println!("  ✓ dim_tempo: {} new key(s)", n),
        Err(e) => eprintln!("  ✗ dim_tempo failed: {:#}", e),
    }
}

// =============================================================================
// KEY RESOLVER
// =============================================================================

/// Business keys resolved to surrogate ids, one map per dimension.
#[derive(Debug, Default)]
struct DimMaps {
    empresas: HashMap<String, i32>,
    variaveis: HashMap<String, i32>,
    servicos: HashMap<String, i32>,
    tempos: HashMap<NaiveDate, i32>,
}

/// Complete business-key -> surrogate-id mapping for one dimension table.
async fn fetch_key_map(
    pool: &PgPool,
    table: &str,
    key_column: &str,
    id_column: &str,
) -> Result<HashMap<String, i32>> {
    let rows: Vec<(i32, String)> =
        sqlx::query_as(&format!("SELECT {}, {} FROM {}", id_column, key_column, table))
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id, key)| (key, id)).collect())
}

async fn fetch_tempo_map(pool: &PgPool) -> Result<HashMap<NaiveDate, i32>> {
    let rows: Vec<(i32, NaiveDate)> = sqlx::query_as("SELECT id_tempo, mes FROM dim_tempo")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id, mes)| (mes, id)).collect())
}

/// Read all four mappings. Runs after the dimension loads so the maps see
/// this run's appends; a query failure here is a connectivity failure.
async fn resolve_dimension_maps(pool: &PgPool) -> Result<DimMaps> {
    Ok(DimMaps {
        empresas: fetch_key_map(pool, "dim_empresa", "nome", "id_empresa")
            .await
            .context("Failed to resolve dim_empresa keys")?,
        variaveis: fetch_key_map(pool, "dim_variavel", "nome_variavel", "id_variavel")
            .await
            .context("Failed to resolve dim_variavel keys")?,
        servicos: fetch_key_map(pool, "dim_servico", "sigla", "id_servico")
            .await
            .context("Failed to resolve dim_servico keys")?,
        tempos: fetch_tempo_map(pool)
            .await
            .context("Failed to resolve dim_tempo keys")?,
    })
}

// =============================================================================
// FACT BUILDER
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct FactRow {
    id_empresa: i32,
    id_variavel: i32,
    id_servico: i32,
    id_tempo: i32,
    valor: f64,
}

/// Why rows were left out of the fact table. Facts + total drops always
/// equals the unified row count.
#[derive(Debug, Default, PartialEq, Eq)]
struct DropStats {
    missing_value: usize,
    invalid_month: usize,
    unresolved_company: usize,
    unresolved_metric: usize,
    unresolved_service: usize,
    unresolved_month: usize,
}

impl DropStats {
    fn total(&self) -> usize {
        self.missing_value
            + self.invalid_month
            + self.unresolved_company
            + self.unresolved_metric
            + self.unresolved_service
            + self.unresolved_month
    }
}

/// Join the unified rows against the four key maps. A fact is built only
/// when the value parsed, the month is valid and all four keys resolve;
/// every other row is dropped with its reason counted.
fn build_facts(rows: &[LongRow], maps: &DimMaps) -> (Vec<FactRow>, DropStats) {
    let mut facts = Vec::new();
    let mut drops = DropStats::default();

    for row in rows {
        let Some(valor) = row.value else {
            drops.missing_value += 1;
            continue;
        };
        let Some(month) = row.month else {
            drops.invalid_month += 1;
            continue;
        };
        let Some(&id_empresa) = maps.empresas.get(&row.company) else {
            drops.unresolved_company += 1;
            continue;
        };
        let Some(&id_variavel) = maps.variaveis.get(&row.metric) else {
            drops.unresolved_metric += 1;
            continue;
        };
        let Some(&id_servico) = maps.servicos.get(&row.service) else {
            drops.unresolved_service += 1;
            continue;
        };
        let Some(&id_tempo) = maps.tempos.get(&month.first_day()) else {
            drops.unresolved_month += 1;
            continue;
        };

        facts.push(FactRow {
            id_empresa,
            id_variavel,
            id_servico,
            id_tempo,
            valor,
        });
    }

    (facts, drops)
}

/// Replace the fact table content inside one transaction: either the new
/// fact set lands completely or the prior content stays untouched. Dimension
/// tables are never truncated.
async fn replace_facts(pool: &PgPool, facts: &[FactRow]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("TRUNCATE TABLE fato_indicadores")
        .execute(&mut *tx)
        .await?;

    for fact in facts {
        sqlx::query(
            "INSERT INTO fato_indicadores (id_empresa, id_variavel, id_servico, id_tempo, valor)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(fact.id_empresa)
        .bind(fact.id_variavel)
        .bind(fact.id_servico)
        .bind(fact.id_tempo)
        .bind(fact.valor)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

// =============================================================================
// VIEWS
// =============================================================================

/// Apply the optional post-load views script. A missing file is reported
/// and skipped, not an error.
async fn apply_views(pool: &PgPool, path: &Path) -> Result<()> {
    if !path.exists() {
        println!("Views script not found at {} - skipping.", path.display());
        return Ok(());
    }

    let sql = fs::read_to_string(path)
        .await
        .context("Failed to read views script")?;
    sqlx::raw_sql(&sql)
        .execute(pool)
        .await
        .context("Failed to apply views script")?;

    println!("Views applied from {}", path.display());
    Ok(())
}

// =============================================================================
// Pipeline
// =============================================================================

fn format_month(month: Option<MonthKey>) -> String {
    month.map_or_else(|| "invalid".to_string(), |m| m.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    let data_dir = args
        .data_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.data_dir.clone());

    println!("=== Anatel Indicadores ETL ===");
    println!("Data dir: {}", data_dir.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let sources = load_sources_config(&args.config).await?;
    println!("Config version: {}", sources.version);

    // ---- transform ----
    println!("\n=== Transform ===");

    let mut batches = Vec::new();
    for source in sources.sources.iter().filter(|s| s.enabled) {
        println!("\n[{}] {}", source.service, source.file);

        let path = data_dir.join(&source.file);
        if !path.exists() {
            eprintln!("  ✗ File not found: {}", path.display());
            continue;
        }

        match process_file(&path) {
            Ok(rows) => {
                println!("  ✓ {} long row(s)", rows.len());
                batches.push((source.service.clone(), rows));
            }
            Err(e) => eprintln!("  ✗ Skipped: {:#}", e),
        }
    }

    let unified = unify(batches);
    if unified.is_empty() {
        println!("\nNo data processed - nothing to load.");
        return Ok(());
    }

    println!("\nUnified rows: {}", unified.len());
    println!(
        "Distinct keys: {} company, {} metric, {} service, {} month",
        distinct_companies(&unified).len(),
        distinct_metrics(&unified).len(),
        distinct_services(&unified).len(),
        distinct_months(&unified).len()
    );

    if args.dry_run {
        for (i, row) in unified.iter().take(5).enumerate() {
            println!(
                "  [{}] {} | {} | {} | {:?} | {}",
                i + 1,
                row.company,
                row.metric,
                format_month(row.month),
                row.value,
                row.service
            );
        }
        if unified.len() > 5 {
            println!("  ... and {} more", unified.len() - 5);
        }
        println!("\nDry run - no database writes.");
        return Ok(());
    }

    // ---- load ----
    println!("\n=== Load ===");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url())
        .await
        .context("Failed to connect to database")?;

    ensure_schema(&pool).await.context("Failed to prepare schema")?;

    load_dimensions(&pool, &unified).await;

    let maps = resolve_dimension_maps(&pool).await?;

    let (facts, drops) = build_facts(&unified, &maps);
    replace_facts(&pool, &facts)
        .await
        .context("Failed to replace fact table")?;
    println!("  ✓ fato_indicadores: {} row(s)", facts.len());

    if args.skip_views {
        println!("Views step skipped (--skip-views).");
    } else if let Err(e) = apply_views(&pool, Path::new(&args.views_sql)).await {
        eprintln!("  ✗ Views step failed: {:#}", e);
    }

    println!("\n=== Summary ===");
    println!("Unified rows:        {}", unified.len());
    println!("Facts loaded:        {}", facts.len());
    println!("Dropped rows:        {}", drops.total());
    println!("  missing value:     {}", drops.missing_value);
    println!("  invalid month:     {}", drops.invalid_month);
    println!("  unresolved keys:   {}", drops.unresolved_company
        + drops.unresolved_metric
        + drops.unresolved_service
        + drops.unresolved_month);

    println!("\n=== Load Complete ===");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(text: &str) -> Option<String> {
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }

    fn fixture_sheet(columns: &[&str], rows: &[&[&str]]) -> RawSheet {
        RawSheet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|c| cell(c)).collect())
                .collect(),
        }
    }

    // -------------------------------------------------------------------------
    // MONTH PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_month_round_trip_formats() {
        for label in ["Jan-19", "2019-01", "01/2019"] {
            let key = parse_month_label(label).unwrap();
            assert_eq!(key.to_string(), "2019-01", "label {:?}", label);
        }
    }

    #[test]
    fn test_month_abbrev_variants() {
        assert_eq!(parse_month_label("dez/2019").unwrap().to_string(), "2019-12");
        assert_eq!(parse_month_label("Fev-19").unwrap().to_string(), "2019-02");
        assert_eq!(parse_month_label(" MAI-19 ").unwrap().to_string(), "2019-05");
    }

    #[test]
    fn test_month_compact_digits() {
        assert_eq!(parse_month_label("201906").unwrap().to_string(), "2019-06");
    }

    #[test]
    fn test_month_invalid_tokens() {
        assert_eq!(parse_month_label("Total"), None);
        assert_eq!(parse_month_label(""), None);
        assert_eq!(parse_month_label("13/2019"), None);
        assert_eq!(parse_month_label("2019-13"), None);
        assert_eq!(parse_month_label("GRUPO ECONÔMICO"), None);
    }

    #[test]
    fn test_month_first_day() {
        let key = MonthKey::new(2019, 1).unwrap();
        assert_eq!(key.first_day(), NaiveDate::from_ymd_opt(2019, 1, 1).unwrap());
    }

    // -------------------------------------------------------------------------
    // NUMERIC COERCION
    // -------------------------------------------------------------------------

    #[test]
    fn test_decimal_rounding() {
        assert_eq!(parse_decimal("123.45678"), Some(123.457));
    }

    #[test]
    fn test_decimal_unparseable() {
        assert_eq!(parse_decimal("abc"), None);
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("-"), None);
    }

    #[test]
    fn test_decimal_ptbr_comma() {
        assert_eq!(parse_decimal("100,5"), Some(100.5));
        assert_eq!(parse_decimal("-3,25"), Some(-3.25));
    }

    #[test]
    fn test_decimal_ptbr_thousands() {
        assert_eq!(parse_decimal("1.234,56"), Some(1234.56));
    }

    #[test]
    fn test_decimal_plain() {
        assert_eq!(parse_decimal("42"), Some(42.0));
        assert_eq!(parse_decimal(" 7.25 "), Some(7.25));
    }

    // -------------------------------------------------------------------------
    // LABEL NORMALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_label_strips_newlines_and_whitespace() {
        assert_eq!(normalize_label(" GRUPO\nECONÔMICO "), "GRUPO ECONÔMICO");
    }

    #[test]
    fn test_value_label_detection() {
        assert!(is_value_label("Jan-19"));
        assert!(is_value_label("2019-01"));
        assert!(is_value_label("dez/2019"));
        assert!(!is_value_label("Total"));
        assert!(!is_value_label("VARIÁVEL"));
    }

    // -------------------------------------------------------------------------
    // RESHAPE (wide -> long)
    // -------------------------------------------------------------------------

    #[test]
    fn test_reshape_melts_rows_by_value_columns() {
        let sheet = fixture_sheet(
            &["GRUPO ECONÔMICO", "VARIÁVEL", "Jan-19", "Fev-19"],
            &[
                &["ACME", "Receita", "100,5", "101,0"],
                &["BETA", "Receita", "50,0", ""],
            ],
        );

        let rows = reshape(&sheet).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].company, "ACME");
        assert_eq!(rows[0].month_label, "Jan-19");
        assert_eq!(rows[0].raw_value, Some("100,5".to_string()));
        assert_eq!(rows[3].company, "BETA");
        assert_eq!(rows[3].raw_value, None);
    }

    #[test]
    fn test_reshape_drops_empty_columns() {
        let sheet = fixture_sheet(
            &["GRUPO ECONÔMICO", "VARIÁVEL", "Obs", "Jan-19"],
            &[&["ACME", "Receita", "", "100,5"]],
        );

        let rows = reshape(&sheet).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].month_label, "Jan-19");
    }

    #[test]
    fn test_reshape_drops_padding_rows() {
        let sheet = fixture_sheet(
            &["GRUPO ECONÔMICO", "VARIÁVEL", "Jan-19"],
            &[
                &["ACME", "Receita", "100,5"],
                &["BETA", "Receita", ""],
            ],
        );

        let rows = reshape(&sheet).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].company, "ACME");
    }

    #[test]
    fn test_reshape_skips_rows_missing_identifiers() {
        let sheet = fixture_sheet(
            &["GRUPO ECONÔMICO", "VARIÁVEL", "Jan-19"],
            &[&["", "Receita", "100,5"], &["ACME", "Receita", "200,0"]],
        );

        let rows = reshape(&sheet).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].company, "ACME");
    }

    #[test]
    fn test_reshape_fails_without_value_columns() {
        let sheet = fixture_sheet(
            &["GRUPO ECONÔMICO", "VARIÁVEL", "Total"],
            &[&["ACME", "Receita", "100"]],
        );
        assert!(reshape(&sheet).is_err());
    }

    #[test]
    fn test_reshape_fails_without_identifier_columns() {
        let sheet = fixture_sheet(&["GRUPO ECONÔMICO"], &[&["ACME"]]);
        assert!(reshape(&sheet).is_err());
    }

    #[test]
    fn test_reshape_normalizes_multiline_labels() {
        let sheet = fixture_sheet(
            &["GRUPO\nECONÔMICO", "VARIÁVEL", "Jan-19\n(mensal)"],
            &[&["ACME", "Receita", "1,0"]],
        );

        let rows = reshape(&sheet).unwrap();
        assert_eq!(rows[0].month_label, "Jan-19 (mensal)");
    }

    // -------------------------------------------------------------------------
    // COERCION OVER RESHAPED ROWS
    // -------------------------------------------------------------------------

    #[test]
    fn test_coerce_maps_values_and_months() {
        let rows = coerce(vec![
            ReshapedRow {
                company: "ACME".to_string(),
                metric: "Receita".to_string(),
                month_label: "Jan-19".to_string(),
                raw_value: Some("100,5".to_string()),
            },
            ReshapedRow {
                company: "ACME".to_string(),
                metric: "Receita".to_string(),
                month_label: "Total".to_string(),
                raw_value: Some("abc".to_string()),
            },
        ]);

        assert_eq!(rows[0].month, MonthKey::new(2019, 1));
        assert_eq!(rows[0].value, Some(100.5));
        assert_eq!(rows[1].month, None);
        assert_eq!(rows[1].value, None);
    }

    // -------------------------------------------------------------------------
    // UNIFICATION
    // -------------------------------------------------------------------------

    fn coerced(company: &str, metric: &str, month: Option<MonthKey>, value: Option<f64>) -> CoercedRow {
        CoercedRow {
            company: company.to_string(),
            metric: metric.to_string(),
            month,
            value,
        }
    }

    #[test]
    fn test_unify_tags_and_preserves_order() {
        let jan = MonthKey::new(2019, 1);
        let unified = unify(vec![
            (
                "SCM".to_string(),
                vec![coerced("ACME", "Receita", jan, Some(1.0))],
            ),
            (
                "SMP".to_string(),
                vec![coerced("BETA", "Receita", jan, Some(2.0))],
            ),
        ]);

        assert_eq!(unified.len(), 2);
        assert_eq!(unified[0].service, "SCM");
        assert_eq!(unified[0].company, "ACME");
        assert_eq!(unified[1].service, "SMP");
        assert_eq!(unified[1].company, "BETA");
    }

    #[test]
    fn test_unify_empty_input() {
        assert!(unify(Vec::new()).is_empty());
    }

    // -------------------------------------------------------------------------
    // DIMENSION KEY DERIVATION
    // -------------------------------------------------------------------------

    fn long(company: &str, metric: &str, service: &str, month: Option<MonthKey>, value: Option<f64>) -> LongRow {
        LongRow {
            company: company.to_string(),
            metric: metric.to_string(),
            month,
            value,
            service: service.to_string(),
        }
    }

    #[test]
    fn test_distinct_keys_deduplicate_and_sort() {
        let jan = MonthKey::new(2019, 1);
        let rows = vec![
            long("BETA", "Receita", "SCM", jan, Some(1.0)),
            long("ACME", "Receita", "SCM", jan, Some(2.0)),
            long("ACME", "Receita", "SMP", None, None),
        ];

        let companies: Vec<String> = distinct_companies(&rows).into_iter().collect();
        assert_eq!(companies, vec!["ACME".to_string(), "BETA".to_string()]);
        assert_eq!(distinct_metrics(&rows).len(), 1);
        assert_eq!(distinct_services(&rows).len(), 2);
        // the invalid month contributes nothing to dim_tempo
        assert_eq!(distinct_months(&rows).len(), 1);
    }

    #[test]
    fn test_keys_to_insert_idempotent() {
        let wanted: BTreeSet<String> =
            ["ACME".to_string(), "BETA".to_string()].into_iter().collect();

        let first = keys_to_insert(&wanted, &HashSet::new());
        assert_eq!(first.len(), 2);

        let loaded: HashSet<String> = wanted.iter().cloned().collect();
        let second = keys_to_insert(&wanted, &loaded);
        assert!(second.is_empty());
    }

    // -------------------------------------------------------------------------
    // FACT BUILDER
    // -------------------------------------------------------------------------

    fn fixture_maps() -> DimMaps {
        DimMaps {
            empresas: [("ACME".to_string(), 1)].into_iter().collect(),
            variaveis: [("Receita".to_string(), 1)].into_iter().collect(),
            servicos: [("SCM".to_string(), 1)].into_iter().collect(),
            tempos: [(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(), 1)]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_build_facts_resolves_all_keys() {
        let jan = MonthKey::new(2019, 1);
        let rows = vec![long("ACME", "Receita", "SCM", jan, Some(100.5))];

        let (facts, drops) = build_facts(&rows, &fixture_maps());
        assert_eq!(facts.len(), 1);
        assert_eq!(drops.total(), 0);
        assert_eq!(
            facts[0],
            FactRow {
                id_empresa: 1,
                id_variavel: 1,
                id_servico: 1,
                id_tempo: 1,
                valor: 100.5,
            }
        );
    }

    #[test]
    fn test_build_facts_drop_reasons_and_accounting() {
        let jan = MonthKey::new(2019, 1);
        let rows = vec![
            long("ACME", "Receita", "SCM", jan, Some(100.5)), // kept
            long("ACME", "Receita", "SCM", jan, None),        // missing value
            long("ACME", "Receita", "SCM", None, Some(1.0)),  // invalid month
            long("GHOST", "Receita", "SCM", jan, Some(1.0)),  // unresolved company
            long("ACME", "Churn", "SCM", jan, Some(1.0)),     // unresolved metric
            long("ACME", "Receita", "STFC", jan, Some(1.0)),  // unresolved service
            long("ACME", "Receita", "SCM", MonthKey::new(2020, 1), Some(1.0)), // unresolved month
        ];

        let (facts, drops) = build_facts(&rows, &fixture_maps());
        assert_eq!(facts.len(), 1);
        assert_eq!(drops.missing_value, 1);
        assert_eq!(drops.invalid_month, 1);
        assert_eq!(drops.unresolved_company, 1);
        assert_eq!(drops.unresolved_metric, 1);
        assert_eq!(drops.unresolved_service, 1);
        assert_eq!(drops.unresolved_month, 1);
        assert_eq!(facts.len() + drops.total(), rows.len());
    }

    // -------------------------------------------------------------------------
    // FULL TRANSFORM SCENARIO
    // -------------------------------------------------------------------------

    #[test]
    fn test_scenario_two_files_one_fact() {
        // File one: ACME reports Receita for Jan-19; a second row carries no
        // month data at all and is padding.
        let scm = fixture_sheet(
            &["GRUPO ECONÔMICO", "VARIÁVEL", "Jan-19"],
            &[
                &["ACME", "Receita", "100,5"],
                &["BETA", "Receita", ""],
            ],
        );
        // File two has a value column the coercer cannot date.
        let smp = fixture_sheet(
            &["GRUPO ECONÔMICO", "VARIÁVEL", "Sem-Data"],
            &[&["ACME", "Receita", "7,0"]],
        );

        let unified = unify(vec![
            ("SCM".to_string(), coerce(reshape(&scm).unwrap())),
            ("SMP".to_string(), coerce(reshape(&smp).unwrap())),
        ]);
        assert_eq!(unified.len(), 2);

        // dim_tempo derives exactly one calendar month (2019-01)
        let months = distinct_months(&unified);
        assert_eq!(months.len(), 1);
        assert_eq!(months.iter().next().unwrap().to_string(), "2019-01");

        let mut maps = fixture_maps();
        maps.servicos.insert("SMP".to_string(), 2);

        let (facts, drops) = build_facts(&unified, &maps);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].valor, 100.5);
        assert_eq!(drops.invalid_month, 1);
        assert_eq!(facts.len() + drops.total(), unified.len());
    }
}
