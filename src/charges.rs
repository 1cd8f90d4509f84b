//! Расчёт начислений за месяц и перезапись строк периода в базе.

use chrono::NaiveDate;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::registry_db::{load_apartments, open_db, Apartment};
use crate::tariffs::{load_tariff_items, resolve_active_tariffs, TariffItem};

/// Одна строка начисления: квартира, период, услуга, сумма в копейках.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeLine {
    pub apartment_id: i64,
    pub apartment_number: u32,
    pub period: String,
    pub item_code: String,
    pub item_name: String,
    pub amount_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct ChargeGenerationResult {
    pub db_path: String,
    pub period: String,
    pub apartment_count: usize,
    pub line_count: usize,
    pub total_cents: i64,
    pub saved: bool,
    pub lines: Vec<ChargeLine>,
}

/// Период начисления — первое число месяца.
pub fn month_start(year: i32, month: u32) -> Result<NaiveDate, String> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| format!("некорректный период: {year}-{month}"))
}

/// Округление суммы в рублях до копеек. Ровно половина копейки
/// округляется от нуля (`f64::round` на значении, умноженном на 100).
pub fn round_cents(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

/// Начисления одной квартиры в фиксированном порядке услуг. Банковский
/// процент считается от суммы уже выпущенных (округлённых) строк, поэтому
/// его база всегда равна видимому итогу квартиры.
pub fn calculate_apartment_charges(
    apartment: &Apartment,
    period: NaiveDate,
    tariffs: &HashMap<String, TariffItem>,
) -> Vec<ChargeLine> {
    let period_text = period.format("%Y-%m-%d").to_string();
    let mut lines: Vec<ChargeLine> = Vec::new();
    let mut subtotal_cents = 0_i64;

    let emit = |lines: &mut Vec<ChargeLine>, code: &str, name: &str, amount_cents: i64| {
        lines.push(ChargeLine {
            apartment_id: apartment.id,
            apartment_number: apartment.number,
            period: period_text.clone(),
            item_code: code.to_string(),
            item_name: name.to_string(),
            amount_cents,
        });
    };

    // 1. Целевой взнос с площади.
    if let Some(tariff) = tariffs.get("target_fee") {
        if apartment.area > 0.0 {
            let amount_cents = round_cents(apartment.area * tariff.value);
            subtotal_cents += amount_cents;
            emit(&mut lines, "target_fee", &tariff.name, amount_cents);
        }
    }

    // 2. Радиоточка, коэффициент может быть дробным (0.5 — общая точка).
    if let Some(tariff) = tariffs.get("radio") {
        if apartment.radio > 0.0 {
            let amount_cents = round_cents(tariff.value * apartment.radio);
            subtotal_cents += amount_cents;
            emit(&mut lines, "radio", &tariff.name, amount_cents);
        }
    }

    // 3. Антенна.
    if let Some(tariff) = tariffs.get("antenna") {
        if apartment.antenna > 0.0 {
            let amount_cents = round_cents(tariff.value * apartment.antenna);
            subtotal_cents += amount_cents;
            emit(&mut lines, "antenna", &tariff.name, amount_cents);
        }
    }

    // 4. Домофон — фиксированная сумма из реестра.
    if apartment.intercom_cents > 0 {
        subtotal_cents += apartment.intercom_cents;
        emit(&mut lines, "intercom", "Домофон", apartment.intercom_cents);
    }

    // 5. Банковский процент от всех услуг выше.
    if let Some(tariff) = tariffs.get("bank_percent") {
        if subtotal_cents > 0 {
            let base_rub = subtotal_cents as f64 / 100.0;
            let amount_cents = round_cents(base_rub * tariff.value / 100.0);
            emit(&mut lines, "bank_percent", &tariff.name, amount_cents);
        }
    }

    lines
}

/// Начисления всего дома за период: свежие снимки реестра и тарифов,
/// обход квартир по возрастанию номера. При `save` строки периода
/// перезаписываются одной транзакцией (удалить, затем вставить) —
/// повторный расчёт не плодит дубликатов.
pub fn generate_charges_at_db_path(
    db_path: &Path,
    year: i32,
    month: u32,
    save: bool,
) -> Result<ChargeGenerationResult, String> {
    let period = month_start(year, month)?;
    let period_text = period.format("%Y-%m-%d").to_string();

    let mut conn = open_db(db_path)?;
    let tariff_items = load_tariff_items(&conn)?;
    let tariffs = resolve_active_tariffs(&tariff_items, period);
    let apartments = load_apartments(&conn)?;

    let mut lines = Vec::new();
    for apartment in &apartments {
        lines.extend(calculate_apartment_charges(apartment, period, &tariffs));
    }

    if save {
        let tx = conn
            .transaction()
            .map_err(|e| format!("не удалось начать транзакцию начислений: {e}"))?;
        tx.execute(
            "DELETE FROM charges WHERE period = ?1",
            params![period_text],
        )
        .map_err(|e| format!("не удалось удалить старые начисления: {e}"))?;
        for line in &lines {
            tx.execute(
                r#"
                INSERT INTO charges(apartment_id, period, item_code, item_name, amount_cents)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    line.apartment_id,
                    line.period,
                    line.item_code,
                    line.item_name,
                    line.amount_cents,
                ],
            )
            .map_err(|e| format!("не удалось сохранить начисление: {e}"))?;
        }
        tx.commit()
            .map_err(|e| format!("не удалось завершить транзакцию начислений: {e}"))?;
    }

    Ok(ChargeGenerationResult {
        db_path: db_path.to_string_lossy().to_string(),
        period: period_text,
        apartment_count: apartments.len(),
        line_count: lines.len(),
        total_cents: lines.iter().map(|l| l.amount_cents).sum(),
        saved: save,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry_db::apply_embedded_migrations;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn create_temp_db_path(prefix: &str) -> PathBuf {
        let unique = format!("{prefix}_{}_{}.db", std::process::id(), Uuid::new_v4());
        std::env::temp_dir().join(unique)
    }

    fn tariff(id: i64, code: &str, name: &str, kind: &str, value: f64) -> TariffItem {
        TariffItem {
            id,
            code: code.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            value,
            valid_from: NaiveDate::from_ymd_opt(2025, 1, 1).expect("date"),
        }
    }

    fn sample_tariffs() -> HashMap<String, TariffItem> {
        [
            tariff(1, "target_fee", "Целевой взнос", "per_area", 30.0),
            tariff(2, "radio", "Радиоточка", "fixed", 60.0),
            tariff(3, "bank_percent", "Банковский процент", "percent", 1.5),
        ]
        .into_iter()
        .map(|t| (t.code.clone(), t))
        .collect()
    }

    fn apartment_12() -> Apartment {
        Apartment {
            id: 1,
            number: 12,
            owner_name: None,
            area: 54.0,
            radio: 1.0,
            antenna: 0.0,
            intercom_cents: 15000,
        }
    }

    #[test]
    fn rounding_ties_go_away_from_zero() {
        assert_eq!(round_cents(0.125), 13);
        assert_eq!(round_cents(0.375), 38);
        assert_eq!(round_cents(-0.125), -13);
        assert_eq!(round_cents(1234.51), 123451);
        // 1234.505 представляется в f64 чуть ниже середины и уходит вниз.
        assert_eq!(round_cents(1234.505), 123450);
    }

    #[test]
    fn charge_lines_for_reference_apartment() {
        let period = NaiveDate::from_ymd_opt(2025, 2, 1).expect("period");
        let lines = calculate_apartment_charges(&apartment_12(), period, &sample_tariffs());

        let codes = lines.iter().map(|l| l.item_code.as_str()).collect::<Vec<_>>();
        assert_eq!(codes, vec!["target_fee", "radio", "intercom", "bank_percent"]);

        let by_code: HashMap<&str, i64> = lines
            .iter()
            .map(|l| (l.item_code.as_str(), l.amount_cents))
            .collect();
        assert_eq!(by_code["target_fee"], 162000);
        assert_eq!(by_code["radio"], 6000);
        assert_eq!(by_code["intercom"], 15000);
        // (1620 + 60 + 150) * 1.5% = 27.45
        assert_eq!(by_code["bank_percent"], 2745);
    }

    #[test]
    fn missing_tariff_or_zero_attribute_skips_the_line() {
        let period = NaiveDate::from_ymd_opt(2025, 2, 1).expect("period");

        let mut no_area = apartment_12();
        no_area.area = 0.0;
        let lines = calculate_apartment_charges(&no_area, period, &sample_tariffs());
        assert!(lines.iter().all(|l| l.item_code != "target_fee"));

        let mut tariffs = sample_tariffs();
        tariffs.remove("radio");
        let lines = calculate_apartment_charges(&apartment_12(), period, &tariffs);
        assert!(lines.iter().all(|l| l.item_code != "radio"));

        // Без положительного промежуточного итога нет и банковского процента.
        let bare = Apartment {
            id: 2,
            number: 13,
            owner_name: None,
            area: 0.0,
            radio: 0.0,
            antenna: 0.0,
            intercom_cents: 0,
        };
        let lines = calculate_apartment_charges(&bare, period, &sample_tariffs());
        assert!(lines.is_empty());
    }

    #[test]
    fn fractional_radio_coefficient_is_billed_proportionally() {
        let period = NaiveDate::from_ymd_opt(2025, 2, 1).expect("period");
        let mut shared = apartment_12();
        shared.radio = 0.5;
        let lines = calculate_apartment_charges(&shared, period, &sample_tariffs());
        let radio = lines.iter().find(|l| l.item_code == "radio").expect("radio");
        assert_eq!(radio.amount_cents, 3000);
    }

    #[test]
    fn charge_generation_is_idempotent_destructive_replace() {
        let db_path = create_temp_db_path("jsk_charges_test");
        apply_embedded_migrations(&db_path).expect("migrate");

        let conn = open_db(&db_path).expect("open");
        conn.execute(
            "INSERT INTO apartments(number, area, radio, antenna, intercom_cents)
             VALUES (12, 54.0, 1, 0, 15000)",
            [],
        )
        .expect("insert apartment");
        for (code, name, kind, value, valid_from) in [
            ("target_fee", "Целевой взнос", "per_area", 30.0, "2025-01-01"),
            // Устаревшая версия того же кода, должна быть перекрыта.
            ("target_fee", "Целевой взнос", "per_area", 25.0, "2024-01-01"),
            ("radio", "Радиоточка", "fixed", 60.0, "2025-01-01"),
            ("bank_percent", "Банковский процент", "percent", 1.5, "2025-01-01"),
            // Версия из будущего не должна участвовать.
            ("radio", "Радиоточка", "fixed", 90.0, "2025-06-01"),
        ] {
            conn.execute(
                "INSERT INTO tariff_items(code, name, kind, value, valid_from)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![code, name, kind, value, valid_from],
            )
            .expect("insert tariff");
        }

        let first = generate_charges_at_db_path(&db_path, 2025, 2, true).expect("first run");
        assert_eq!(first.line_count, 4);
        assert_eq!(first.total_cents, 162000 + 6000 + 15000 + 2745);

        let second = generate_charges_at_db_path(&db_path, 2025, 2, true).expect("second run");
        assert_eq!(second.line_count, first.line_count);
        assert_eq!(second.total_cents, first.total_cents);

        let row_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM charges WHERE period = '2025-02-01'",
                [],
                |row| row.get(0),
            )
            .expect("count charges");
        assert_eq!(row_count, 4);

        let target_fee_cents: i64 = conn
            .query_row(
                "SELECT amount_cents FROM charges
                 WHERE period = '2025-02-01' AND item_code = 'target_fee'",
                [],
                |row| row.get(0),
            )
            .expect("target_fee row");
        assert_eq!(target_fee_cents, 162000);

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let db_path = create_temp_db_path("jsk_charges_dry_run_test");
        apply_embedded_migrations(&db_path).expect("migrate");

        let conn = open_db(&db_path).expect("open");
        conn.execute(
            "INSERT INTO apartments(number, area, radio, antenna, intercom_cents)
             VALUES (5, 40.0, 0, 0, 0)",
            [],
        )
        .expect("insert apartment");
        conn.execute(
            "INSERT INTO tariff_items(code, name, kind, value, valid_from)
             VALUES ('target_fee', 'Целевой взнос', 'per_area', 30.0, '2025-01-01')",
            [],
        )
        .expect("insert tariff");

        let result = generate_charges_at_db_path(&db_path, 2025, 2, false).expect("dry run");
        assert_eq!(result.line_count, 1);
        assert!(!result.saved);

        let row_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM charges", [], |row| row.get(0))
            .expect("count charges");
        assert_eq!(row_count, 0);

        let _ = fs::remove_file(&db_path);
    }
}
