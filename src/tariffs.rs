//! Историчные тарифы: загрузка и выбор действующей версии на период.

use chrono::NaiveDate;
use rusqlite::Connection;
use std::collections::HashMap;

pub const TARIFF_KIND_CHOICES: &[&str] = &["per_area", "fixed", "percent"];

/// Версия тарифа. Один код может иметь несколько версий с разными `valid_from`.
#[derive(Debug, Clone)]
pub struct TariffItem {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub kind: String,
    pub value: f64,
    pub valid_from: NaiveDate,
}

pub fn load_tariff_items(conn: &Connection) -> Result<Vec<TariffItem>, String> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, code, name, kind, value, valid_from
            FROM tariff_items
            ORDER BY code ASC, valid_from ASC, id ASC
            "#,
        )
        .map_err(|e| format!("не удалось прочитать тарифы: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(|e| format!("не удалось прочитать тарифы: {e}"))?;

    let mut items = Vec::new();
    for row in rows {
        let (id, code, name, kind, value, valid_from_text) =
            row.map_err(|e| format!("не удалось прочитать тариф: {e}"))?;
        if !TARIFF_KIND_CHOICES.contains(&kind.as_str()) {
            return Err(format!("тариф id={id}: неизвестный вид «{kind}»"));
        }
        let valid_from = NaiveDate::parse_from_str(&valid_from_text, "%Y-%m-%d")
            .map_err(|_| format!("тариф id={id}: некорректная дата valid_from «{valid_from_text}»"))?;
        items.push(TariffItem {
            id,
            code,
            name,
            kind,
            value,
            valid_from,
        });
    }
    Ok(items)
}

/// Для каждого кода — версия с самым поздним `valid_from <= period`.
/// Версии из будущего не участвуют; код без подходящей версии в карту
/// не попадает (услуга в периоде не начисляется). При равных `valid_from`
/// действует версия с большим id.
pub fn resolve_active_tariffs(
    items: &[TariffItem],
    period: NaiveDate,
) -> HashMap<String, TariffItem> {
    let mut result: HashMap<String, TariffItem> = HashMap::new();
    for item in items {
        if item.valid_from > period {
            continue;
        }
        let replace = match result.get(&item.code) {
            Some(prev) => (item.valid_from, item.id) > (prev.valid_from, prev.id),
            None => true,
        };
        if replace {
            result.insert(item.code.clone(), item.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tariff(id: i64, code: &str, value: f64, valid_from: (i32, u32, u32)) -> TariffItem {
        TariffItem {
            id,
            code: code.to_string(),
            name: code.to_string(),
            kind: "fixed".to_string(),
            value,
            valid_from: NaiveDate::from_ymd_opt(valid_from.0, valid_from.1, valid_from.2)
                .expect("valid date"),
        }
    }

    fn period(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).expect("period")
    }

    #[test]
    fn latest_version_not_after_period_wins() {
        let items = vec![
            tariff(1, "radio", 50.0, (2024, 1, 1)),
            tariff(2, "radio", 60.0, (2025, 1, 1)),
            tariff(3, "radio", 70.0, (2025, 6, 1)),
        ];
        let active = resolve_active_tariffs(&items, period(2025, 2));
        assert_eq!(active["radio"].value, 60.0);
    }

    #[test]
    fn future_versions_are_ignored_entirely() {
        let items = vec![tariff(1, "antenna", 120.0, (2025, 6, 1))];
        let active = resolve_active_tariffs(&items, period(2025, 2));
        assert!(!active.contains_key("antenna"));
    }

    #[test]
    fn equal_valid_from_resolves_to_highest_id() {
        let items = vec![
            tariff(4, "target_fee", 30.0, (2025, 1, 1)),
            tariff(9, "target_fee", 32.0, (2025, 1, 1)),
            tariff(7, "target_fee", 31.0, (2025, 1, 1)),
        ];
        let active = resolve_active_tariffs(&items, period(2025, 2));
        assert_eq!(active["target_fee"].id, 9);
        assert_eq!(active["target_fee"].value, 32.0);
    }

    #[test]
    fn resolution_is_monotonic_between_version_changes() {
        let items = vec![
            tariff(1, "radio", 60.0, (2025, 1, 1)),
            tariff(2, "target_fee", 30.0, (2024, 7, 1)),
        ];
        let february = resolve_active_tariffs(&items, period(2025, 2));
        let april = resolve_active_tariffs(&items, period(2025, 4));
        assert_eq!(february.len(), april.len());
        for (code, item) in &february {
            assert_eq!(april[code].id, item.id);
        }
    }
}
