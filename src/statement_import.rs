//! Импорт банковской выписки: нормализация листа, привязка платежей к
//! квартирам, ручное доопределение и сохранение результата.

use calamine::{open_workbook_auto, Reader};
use chrono::{Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

use crate::apartment_extract::guess_apartment_number;
use crate::registry_db::{load_apartments, open_db, Apartment};

/// Строки 1–9 выписки — шапка документа, подписи колонок стоят в 10-й строке.
const STATEMENT_HEADER_ROW_INDEX: usize = 9;
/// Сколько первых значений колонки просматривается при поиске блока отправителя.
const SENDER_SCAN_ROWS: usize = 10;

#[derive(Debug)]
struct AliasSpec {
    field: &'static str,
    aliases: &'static [&'static str],
}

const STATEMENT_ALIAS_SPECS: &[AliasSpec] = &[
    AliasSpec {
        field: "date",
        aliases: &["дата проводки", "дата операции", "дата", "date"],
    },
    AliasSpec {
        field: "amount",
        aliases: &["сумма", "сумма операции", "сумма платежа", "amount"],
    },
    AliasSpec {
        field: "credit_amount",
        aliases: &["сумма по кредиту", "кредит", "приход", "credit"],
    },
    AliasSpec {
        field: "debit_amount",
        aliases: &["сумма по дебету", "дебет", "расход", "debit"],
    },
    AliasSpec {
        field: "description",
        aliases: &["назначение платежа", "описание", "description"],
    },
];

/// Признаки адресного блока: фрагмент названия банка и адресные пометки.
const SENDER_INFO_MARKERS: &[&str] = &["банк", "ул.", "ул ", "г.", "д.", "корп", "кв"];

/// Строка выписки после нормализации и автопоиска квартиры.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedPayment {
    pub date: String,
    pub amount_cents: i64,
    pub description: String,
    pub sender_info: Option<String>,
    pub guessed_apartment_number: Option<u32>,
}

/// Платёж, привязанный к квартире. Создаётся заново при привязке,
/// исходная запись не мутируется.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPayment {
    pub apartment_id: i64,
    pub apartment_number: u32,
    pub date: String,
    pub amount_cents: i64,
    pub description: String,
}

#[derive(Debug)]
pub struct StatementParse {
    pub payments: Vec<ParsedPayment>,
    pub mapping: BTreeMap<String, String>,
    pub dropped: Vec<String>,
    pub notes: Vec<String>,
    pub source_file: String,
}

#[derive(Debug)]
pub struct StatementReconcileResult {
    pub source_file: String,
    pub matched: Vec<ResolvedPayment>,
    pub unmatched: Vec<ParsedPayment>,
    pub mapping: BTreeMap<String, String>,
    pub dropped: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentSaveRequest {
    pub source_file: String,
    pub matched: Vec<ResolvedPayment>,
    pub unmatched: Vec<ParsedPayment>,
    pub mapping: BTreeMap<String, String>,
    pub dropped: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentSaveResult {
    pub db_path: String,
    pub import_job_id: String,
    pub matched_count: i64,
    pub unmatched_count: i64,
    pub dropped_count: i64,
}

fn trim_cell(text: &str) -> String {
    text.trim()
        .trim_start_matches('\u{feff}')
        .trim()
        .to_string()
}

fn normalize_label(label: &str) -> String {
    trim_cell(label)
        .to_lowercase()
        .replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Точный разбор суммы в копейки: пробелы и знак рубля отбрасываются,
/// десятичный разделитель — запятая или точка, не более двух знаков дроби.
pub fn parse_amount_to_cents(raw: &str) -> Result<i64, String> {
    let mut s = raw
        .trim()
        .replace('\u{a0}', "")
        .replace(' ', "")
        .replace('₽', "")
        .replace(',', ".");
    if s.is_empty() {
        return Err("пустая сумма".to_string());
    }

    let negative = s.starts_with('-');
    if s.starts_with('-') || s.starts_with('+') {
        s = s[1..].to_string();
    }
    if s.is_empty() {
        return Err("сумма не распознана".to_string());
    }

    let parts = s.split('.').collect::<Vec<_>>();
    if parts.len() > 2 {
        return Err("сумма не распознана".to_string());
    }
    let int_part = if parts[0].is_empty() { "0" } else { parts[0] };
    if !int_part.chars().all(|c| c.is_ascii_digit()) {
        return Err("сумма не распознана".to_string());
    }
    let frac_part = if parts.len() == 2 { parts[1] } else { "" };
    if !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return Err("сумма не распознана".to_string());
    }
    if frac_part.len() > 2 {
        return Err("в сумме больше двух знаков после запятой".to_string());
    }

    let int_val = int_part
        .parse::<i64>()
        .map_err(|_| "сумма вне допустимого диапазона".to_string())?;
    let frac_val = match frac_part.len() {
        0 => 0_i64,
        1 => {
            frac_part
                .parse::<i64>()
                .map_err(|_| "сумма не распознана".to_string())?
                * 10
        }
        2 => frac_part
            .parse::<i64>()
            .map_err(|_| "сумма не распознана".to_string())?,
        _ => unreachable!(),
    };

    let mut cents = int_val
        .checked_mul(100)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or_else(|| "сумма вне допустимого диапазона".to_string())?;
    if negative {
        cents = -cents;
    }
    Ok(cents)
}

/// Дата проводки: текстовые форматы выписки, затем порядковый номер дня
/// Excel от базы 1899-12-30.
pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let text = trim_cell(raw);
    if text.is_empty() {
        return None;
    }
    let first_token = text.split([' ', 'T']).next().map(trim_cell)?;

    for fmt in ["%d.%m.%Y", "%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&first_token, fmt) {
            return Some(date);
        }
    }

    let number = text.parse::<f64>().ok()?;
    if !number.is_finite() || number <= 0.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(Duration::days(number.floor() as i64))
}

fn row_get(row: &[String], idx: Option<usize>) -> String {
    idx.and_then(|i| row.get(i).cloned())
        .map(|s| trim_cell(&s))
        .unwrap_or_default()
}

fn read_csv_rows(path: &Path) -> Result<Vec<Vec<String>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("не удалось прочитать CSV: {e}"))?;

    let mut rows = Vec::new();
    for rec in reader.records() {
        let rec = rec.map_err(|e| format!("не удалось прочитать строку CSV: {e}"))?;
        rows.push(rec.iter().map(trim_cell).collect());
    }
    Ok(rows)
}

fn read_xlsx_rows(path: &Path) -> Result<Vec<Vec<String>>, String> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| format!("не удалось открыть xlsx: {e}"))?;
    let sheet_names = workbook.sheet_names().to_owned();
    let first_sheet = sheet_names
        .first()
        .cloned()
        .ok_or_else(|| "в xlsx нет ни одного листа".to_string())?;

    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| format!("не удалось прочитать лист xlsx: {e}"))?;

    let rows = range
        .rows()
        .map(|row| {
            row.iter()
                .map(|cell| trim_cell(&cell.to_string()))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    Ok(rows)
}

fn read_statement_rows(file_path: &Path) -> Result<Vec<Vec<String>>, String> {
    if !file_path.exists() {
        return Err(format!(
            "файл выписки не найден: {}",
            file_path.to_string_lossy()
        ));
    }
    if !file_path.is_file() {
        return Err(format!(
            "путь не является файлом: {}",
            file_path.to_string_lossy()
        ));
    }

    let suffix = file_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match suffix.as_str() {
        "csv" => read_csv_rows(file_path),
        "xlsx" => read_xlsx_rows(file_path),
        _ => Err(format!(
            "неподдерживаемый формат файла: .{suffix} (ожидается .csv или .xlsx)"
        )),
    }
}

fn resolve_column_mapping(header_row: &[String]) -> HashMap<&'static str, usize> {
    let mut normalized: HashMap<String, usize> = HashMap::new();
    for (idx, cell) in header_row.iter().enumerate() {
        let key = normalize_label(cell);
        if !key.is_empty() {
            normalized.entry(key).or_insert(idx);
        }
    }

    let mut mapping = HashMap::new();
    for spec in STATEMENT_ALIAS_SPECS {
        for alias in spec.aliases {
            if let Some(idx) = normalized.get(&normalize_label(alias)) {
                mapping.insert(spec.field, *idx);
                break;
            }
        }
    }
    mapping
}

/// Колонка адресного блока отправителя: первая из не занятых схемой колонок,
/// в первых значениях которой встретился адресный признак. Отсутствие — норма.
fn detect_sender_info_column(
    data_rows: &[Vec<String>],
    column_count: usize,
    used: &HashSet<usize>,
) -> Option<usize> {
    for col in 0..column_count {
        if used.contains(&col) {
            continue;
        }
        let hit = data_rows
            .iter()
            .take(SENDER_SCAN_ROWS)
            .map(|row| row_get(row, Some(col)).to_lowercase())
            .any(|cell| SENDER_INFO_MARKERS.iter().any(|m| cell.contains(m)));
        if hit {
            return Some(col);
        }
    }
    None
}

fn header_label(header_row: &[String], idx: usize) -> String {
    let label = row_get(header_row, Some(idx));
    if label.is_empty() {
        format!("колонка {}", idx + 1)
    } else {
        label
    }
}

/// Чтение и нормализация выписки: подписи колонок ищутся по алиасам в 10-й
/// строке, строки с нечитаемой датой или суммой отбрасываются с указанием
/// причины, полностью пустые строки пропускаются.
pub fn parse_statement_file(file_path: &Path) -> Result<StatementParse, String> {
    let rows = read_statement_rows(file_path)?;
    if rows.len() <= STATEMENT_HEADER_ROW_INDEX {
        return Err(format!(
            "в файле нет строки с подписями колонок (ожидалась строка {})",
            STATEMENT_HEADER_ROW_INDEX + 1
        ));
    }

    let header_row = &rows[STATEMENT_HEADER_ROW_INDEX];
    let mapping_idx = resolve_column_mapping(header_row);

    let date_idx = mapping_idx.get("date").copied();
    let description_idx = mapping_idx.get("description").copied();
    let amount_idx = mapping_idx.get("amount").copied();
    let credit_idx = mapping_idx.get("credit_amount").copied();
    let effective_amount_idx = amount_idx.or(credit_idx);

    let mut missing = Vec::new();
    if date_idx.is_none() {
        missing.push("дата");
    }
    if effective_amount_idx.is_none() {
        missing.push("сумма");
    }
    if description_idx.is_none() {
        missing.push("назначение платежа");
    }
    if !missing.is_empty() {
        return Err(format!(
            "не удалось определить колонки выписки: {}",
            missing.join(", ")
        ));
    }

    let mut notes = Vec::new();
    if amount_idx.is_none() {
        if let Some(idx) = credit_idx {
            notes.push(format!(
                "сумма берётся из колонки прихода «{}»",
                header_label(header_row, idx)
            ));
        }
    }
    if let Some(idx) = mapping_idx.get("debit_amount").copied() {
        notes.push(format!(
            "колонка расхода «{}» присутствует и не используется",
            header_label(header_row, idx)
        ));
    }

    let data_rows = &rows[STATEMENT_HEADER_ROW_INDEX + 1..];
    let used_columns: HashSet<usize> = mapping_idx.values().copied().collect();
    let sender_idx = detect_sender_info_column(data_rows, header_row.len(), &used_columns);

    let mut mapping = BTreeMap::new();
    if let Some(idx) = date_idx {
        mapping.insert("date".to_string(), header_label(header_row, idx));
    }
    if let Some(idx) = effective_amount_idx {
        let field = if amount_idx.is_some() { "amount" } else { "credit_amount" };
        mapping.insert(field.to_string(), header_label(header_row, idx));
    }
    if let Some(idx) = description_idx {
        mapping.insert("description".to_string(), header_label(header_row, idx));
    }
    if let Some(idx) = mapping_idx.get("debit_amount").copied() {
        mapping.insert("debit_amount".to_string(), header_label(header_row, idx));
    }
    if let Some(idx) = sender_idx {
        mapping.insert("sender_info".to_string(), header_label(header_row, idx));
    }

    let mut payments = Vec::new();
    let mut dropped = Vec::new();

    for (offset, row) in data_rows.iter().enumerate() {
        let line_no = STATEMENT_HEADER_ROW_INDEX + 2 + offset;
        if row.iter().all(|c| trim_cell(c).is_empty()) {
            continue;
        }

        let date_raw = row_get(row, date_idx);
        let date = match parse_date_text(&date_raw) {
            Some(d) => d.format("%Y-%m-%d").to_string(),
            None => {
                dropped.push(format!("строка {line_no}: дата не распознана: «{date_raw}»"));
                continue;
            }
        };

        let amount_raw = row_get(row, effective_amount_idx);
        let amount_cents = match parse_amount_to_cents(&amount_raw) {
            Ok(v) => v,
            Err(reason) => {
                dropped.push(format!("строка {line_no}: {reason}: «{amount_raw}»"));
                continue;
            }
        };

        let description = row_get(row, description_idx);
        let sender_info = {
            let text = row_get(row, sender_idx);
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        };
        let guessed_apartment_number =
            guess_apartment_number(&description, sender_info.as_deref());

        payments.push(ParsedPayment {
            date,
            amount_cents,
            description,
            sender_info,
            guessed_apartment_number,
        });
    }

    Ok(StatementParse {
        payments,
        mapping,
        dropped,
        notes,
        source_file: file_path.to_string_lossy().to_string(),
    })
}

/// Предпросмотр выписки без обращения к базе.
pub fn statement_preview_file_at_path(file_path: &Path) -> Result<Value, String> {
    let parse = parse_statement_file(file_path)?;
    let preview_rows = parse
        .payments
        .iter()
        .take(10)
        .map(|p| {
            json!({
                "date": p.date,
                "amount_cents": p.amount_cents,
                "description": p.description,
                "guessed_apartment_number": p.guessed_apartment_number,
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "file": parse.source_file,
        "mapping": parse.mapping,
        "notes": parse.notes,
        "parsed_count": parse.payments.len(),
        "dropped_count": parse.dropped.len(),
        "dropped": parse.dropped.into_iter().take(20).collect::<Vec<_>>(),
        "preview_rows": preview_rows,
    }))
}

/// Разделение платежей по реестру: угаданный номер, найденный в реестре,
/// даёт новую привязанную запись; остальные уходят в неопознанные.
/// Относительный порядок в обеих частях сохраняется.
pub fn attach_apartment_ids(
    apartments: &[Apartment],
    payments: Vec<ParsedPayment>,
) -> (Vec<ResolvedPayment>, Vec<ParsedPayment>) {
    let by_number: HashMap<u32, i64> = apartments.iter().map(|a| (a.number, a.id)).collect();

    let mut matched = Vec::new();
    let mut unmatched = Vec::new();
    for payment in payments {
        let hit = payment
            .guessed_apartment_number
            .and_then(|n| by_number.get(&n).map(|id| (*id, n)));
        match hit {
            Some((apartment_id, apartment_number)) => matched.push(ResolvedPayment {
                apartment_id,
                apartment_number,
                date: payment.date,
                amount_cents: payment.amount_cents,
                description: payment.description,
            }),
            None => unmatched.push(payment),
        }
    }
    (matched, unmatched)
}

/// Разбор файла и автоматическая привязка по свежему снимку реестра.
pub fn reconcile_statement_at_db_path(
    db_path: &Path,
    file_path: &Path,
) -> Result<StatementReconcileResult, String> {
    let parse = parse_statement_file(file_path)?;
    let conn = open_db(db_path)?;
    let apartments = load_apartments(&conn)?;
    let (matched, unmatched) = attach_apartment_ids(&apartments, parse.payments);

    Ok(StatementReconcileResult {
        source_file: parse.source_file,
        matched,
        unmatched,
        mapping: parse.mapping,
        dropped: parse.dropped,
        notes: parse.notes,
    })
}

/// Ручное доопределение оператора: `overrides` — индекс неопознанного платежа
/// → id квартиры из реестра. Чистое переразбиение без собственной логики
/// сопоставления; пустой набор переопределений — тождественный проход.
pub fn apply_manual_overrides(
    auto_matched: Vec<ResolvedPayment>,
    unmatched: Vec<ParsedPayment>,
    overrides: &HashMap<usize, i64>,
    apartments: &[Apartment],
) -> Result<(Vec<ResolvedPayment>, Vec<ParsedPayment>), String> {
    let number_by_id: HashMap<i64, u32> = apartments.iter().map(|a| (a.id, a.number)).collect();

    for (idx, apartment_id) in overrides {
        if *idx >= unmatched.len() {
            return Err(format!("нет неопознанного платежа с индексом {idx}"));
        }
        if !number_by_id.contains_key(apartment_id) {
            return Err(format!("в реестре нет квартиры с id={apartment_id}"));
        }
    }

    let mut final_matched = Vec::new();
    let mut final_unmatched = Vec::new();
    for (idx, payment) in unmatched.into_iter().enumerate() {
        match overrides.get(&idx) {
            Some(apartment_id) => final_matched.push(ResolvedPayment {
                apartment_id: *apartment_id,
                apartment_number: number_by_id[apartment_id],
                date: payment.date,
                amount_cents: payment.amount_cents,
                description: payment.description,
            }),
            None => final_unmatched.push(payment),
        }
    }
    final_matched.extend(auto_matched);

    Ok((final_matched, final_unmatched))
}

fn raw_info_text(payment: &ParsedPayment) -> String {
    match payment.guessed_apartment_number {
        Some(n) => format!("guessed={n}"),
        None => "guessed=none".to_string(),
    }
}

/// Сохранение итогов импорта одной транзакцией: запись в журнал импорта,
/// привязанные платежи в `payments`, остальные в `unmatched_payments`.
pub fn save_payments_at_db_path(
    db_path: &Path,
    request: PaymentSaveRequest,
) -> Result<PaymentSaveResult, String> {
    let mut conn = open_db(db_path)?;

    let job_id = Uuid::new_v4().to_string();
    let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let metadata_json = serde_json::to_string(&json!({
        "source_file": request.source_file,
        "mapping": request.mapping,
        "notes": request.notes,
    }))
    .map_err(|e| format!("не удалось сериализовать метаданные импорта: {e}"))?;
    let error_message = if request.dropped.is_empty() {
        None
    } else {
        Some(
            request
                .dropped
                .iter()
                .take(20)
                .cloned()
                .collect::<Vec<_>>()
                .join("\n"),
        )
    };

    let matched_count = request.matched.len() as i64;
    let unmatched_count = request.unmatched.len() as i64;
    let dropped_count = request.dropped.len() as i64;

    let tx = conn
        .transaction()
        .map_err(|e| format!("не удалось начать транзакцию сохранения: {e}"))?;

    tx.execute(
        r#"
        INSERT INTO import_jobs(
            id, source_file, status, started_at, finished_at,
            total_count, matched_count, unmatched_count, dropped_count,
            error_message, metadata_json
        )
        VALUES (?1, ?2, 'success', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            job_id,
            request.source_file,
            started_at,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            matched_count + unmatched_count + dropped_count,
            matched_count,
            unmatched_count,
            dropped_count,
            error_message,
            metadata_json,
        ],
    )
    .map_err(|e| format!("не удалось записать журнал импорта: {e}"))?;

    for payment in &request.matched {
        tx.execute(
            r#"
            INSERT INTO payments(apartment_id, date, amount_cents, description, import_job_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                payment.apartment_id,
                payment.date,
                payment.amount_cents,
                payment.description,
                job_id,
            ],
        )
        .map_err(|e| format!("не удалось сохранить платёж: {e}"))?;
    }

    for payment in &request.unmatched {
        tx.execute(
            r#"
            INSERT INTO unmatched_payments(date, amount_cents, description, raw_info, import_job_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                payment.date,
                payment.amount_cents,
                payment.description,
                raw_info_text(payment),
                job_id,
            ],
        )
        .map_err(|e| format!("не удалось сохранить неопознанный платёж: {e}"))?;
    }

    tx.commit()
        .map_err(|e| format!("не удалось завершить транзакцию сохранения: {e}"))?;

    Ok(PaymentSaveResult {
        db_path: db_path.to_string_lossy().to_string(),
        import_job_id: job_id,
        matched_count,
        unmatched_count,
        dropped_count,
    })
}
