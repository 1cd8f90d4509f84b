//! Определение номера квартиры по назначению платежа и блоку отправителя.

use regex::Regex;
use std::sync::OnceLock;

/// Адрес дома кооператива. Блок отправителя относится к нашему дому,
/// только если присутствуют все три признака.
const COOP_ADDRESS_TOKENS: &[&str] = &["гагарина", "д. 12", "корп. 2"];

/// Правило каскада: имя фиксирует договорённость, порядок в таблице — приоритет.
#[derive(Debug)]
struct ExtractRule {
    name: &'static str,
    pattern: &'static str,
}

/// В блоке отправителя ищем только явную пометку квартиры.
const SENDER_RULES: &[ExtractRule] = &[ExtractRule {
    name: "sender_kv",
    pattern: r"(?i)кв[.\s]*(\d{1,3})",
}];

/// Каскад по назначению платежа, первый сработавший выигрывает:
/// хвостовой код после `;`, сокращение «кв», слово «квартира», лицевой счёт.
const DESCRIPTION_RULES: &[ExtractRule] = &[
    ExtractRule {
        name: "trailing_account_code",
        pattern: r"(?i);\s*0*(\d{1,3})\s*$",
    },
    ExtractRule {
        name: "kv_abbrev",
        pattern: r"(?i)кв[.\s-]*(\d{1,3})",
    },
    ExtractRule {
        name: "kv_word",
        pattern: r"(?i)квартира\s*(\d{1,3})",
    },
    ExtractRule {
        name: "ls_account",
        pattern: r"(?i)л/с\s*(\d{1,3})",
    },
];

fn compile_rules(rules: &'static [ExtractRule]) -> Vec<Regex> {
    rules
        .iter()
        .map(|rule| {
            Regex::new(rule.pattern)
                .unwrap_or_else(|e| panic!("invalid extract rule {}: {e}", rule.name))
        })
        .collect()
}

fn sender_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| compile_rules(SENDER_RULES))
}

fn description_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| compile_rules(DESCRIPTION_RULES))
}

fn first_rule_match(regexes: &[Regex], text: &str) -> Option<u32> {
    for re in regexes {
        if let Some(caps) = re.captures(text) {
            if let Some(number) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
                if number > 0 {
                    return Some(number);
                }
            }
        }
    }
    None
}

/// Блок отправителя содержит адрес нашего дома?
pub fn sender_matches_coop_address(sender_info: &str) -> bool {
    let text = sender_info.to_lowercase();
    COOP_ADDRESS_TOKENS.iter().all(|token| text.contains(token))
}

/// Номер квартиры из блока отправителя. `None`, если адрес не наш
/// или пометки квартиры в блоке нет.
pub fn guess_from_sender_info(sender_info: &str) -> Option<u32> {
    if !sender_matches_coop_address(sender_info) {
        return None;
    }
    first_rule_match(sender_regexes(), sender_info)
}

/// Номер квартиры из назначения платежа.
pub fn guess_from_description(description: &str) -> Option<u32> {
    if description.trim().is_empty() {
        return None;
    }
    first_rule_match(description_regexes(), description)
}

/// Двухуровневое определение: блок отправителя главнее назначения платежа.
/// Отсутствие номера — обычный исход, а не ошибка.
pub fn guess_apartment_number(description: &str, sender_info: Option<&str>) -> Option<u32> {
    if let Some(sender) = sender_info {
        if let Some(number) = guess_from_sender_info(sender) {
            return Some(number);
        }
    }
    guess_from_description(description)
}
