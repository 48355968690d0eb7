// ── Device classification ──
//
// Decides what a BLE advertisement probably is and how likely it is to be
// a cycling sensor. The score is a sorting aid for pickers and never
// gates a connect.

use uuid::Uuid;

use super::gatt;
use crate::types::SensorKind;

/// Outcome of classifying one advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: SensorKind,
    /// 0–100.
    pub score: u8,
    pub manufacturer: Option<String>,
}

struct Keyword {
    text: &'static str,
    kind: Option<SensorKind>,
    score: u8,
    /// Short tokens only match whole words ("hr" must not match "three").
    whole_word: bool,
}

const fn kw(text: &'static str, kind: SensorKind, score: u8) -> Keyword {
    Keyword {
        text,
        kind: Some(kind),
        score,
        whole_word: text.len() < 4,
    }
}

const fn brand(text: &'static str, kind: Option<SensorKind>, score: u8) -> Keyword {
    Keyword {
        text,
        kind,
        score,
        whole_word: false,
    }
}

/// Class words, in classification priority order.
const KEYWORDS: &[Keyword] = &[
    kw("power", SensorKind::Power, 80),
    kw("pwr", SensorKind::Power, 70),
    kw("watt", SensorKind::Power, 70),
    kw("trainer", SensorKind::Trainer, 80),
    kw("kickr", SensorKind::Trainer, 80),
    kw("ftms", SensorKind::Trainer, 75),
    kw("cadence", SensorKind::Cadence, 80),
    kw("cad", SensorKind::Cadence, 60),
    kw("rpm", SensorKind::Cadence, 60),
    kw("speed", SensorKind::Speed, 80),
    kw("spd", SensorKind::Speed, 60),
    kw("heart", SensorKind::HeartRate, 80),
    kw("hrm", SensorKind::HeartRate, 75),
    kw("tickr", SensorKind::HeartRate, 75),
    kw("h10", SensorKind::HeartRate, 70),
    kw("hr", SensorKind::HeartRate, 50),
];

/// Brands that make cycling sensors. Some imply a kind.
const BRANDS: &[Keyword] = &[
    brand("assioma", Some(SensorKind::Power), 80),
    brand("favero", Some(SensorKind::Power), 80),
    brand("stages", Some(SensorKind::Power), 80),
    brand("quarq", Some(SensorKind::Power), 80),
    brand("4iiii", Some(SensorKind::Power), 80),
    brand("powertap", Some(SensorKind::Power), 80),
    brand("tacx", Some(SensorKind::Trainer), 80),
    brand("saris", Some(SensorKind::Trainer), 75),
    brand("elite", Some(SensorKind::Trainer), 70),
    brand("wattbike", Some(SensorKind::Trainer), 80),
    brand("wahoo", None, 80),
    brand("garmin", None, 75),
    brand("zwift", None, 75),
    brand("polar", None, 70),
    brand("magene", None, 70),
    brand("coospo", None, 70),
    brand("bryton", None, 65),
    brand("sigma", None, 65),
    brand("suunto", None, 65),
];

/// Names of things that advertise nearby but are never cycling sensors.
const NON_CYCLING: &[&str] = &[
    "airpods", "buds", "headphone", "headset", "speaker", "soundbar", "keyboard", "mouse",
    "iphone", "ipad", "macbook", "jbl", "bose", "sonos", "tv",
];

const NON_CYCLING_PENALTY: u8 = 40;
const RESOLVED_SCORE: u8 = 90;
const UNKNOWN_FLOOR: u8 = 10;

/// Classify one advertisement.
pub fn classify(
    name: Option<&str>,
    services: &[Uuid],
    manufacturer_id: Option<u16>,
) -> Classification {
    let lowered = name.map(str::to_lowercase).unwrap_or_default();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let keyword_hit = first_match(KEYWORDS, &lowered, &words);
    let brand_hit = first_match(BRANDS, &lowered, &words);

    let kind = kind_from_services(services)
        .or_else(|| keyword_hit.and_then(|k| k.kind))
        .or_else(|| brand_hit.and_then(|b| b.kind))
        .unwrap_or(SensorKind::Unknown);

    let resolved = if kind == SensorKind::Unknown { 0 } else { RESOLVED_SCORE };
    let signals = [
        resolved,
        service_score(services),
        brand_hit.map_or(0, |b| b.score),
        keyword_hit.map_or(0, |k| k.score),
    ];
    let mut score = signals.into_iter().max().unwrap_or(0);
    if score == 0 {
        score = UNKNOWN_FLOOR;
    }
    if NON_CYCLING
        .iter()
        .any(|n| matches_keyword(n, n.len() < 4, &lowered, &words))
    {
        score = score.saturating_sub(NON_CYCLING_PENALTY);
    }

    let manufacturer = manufacturer_id
        .and_then(gatt::company_name)
        .map(str::to_owned)
        .or_else(|| brand_hit.map(|b| capitalize(b.text)));

    Classification {
        kind,
        score: score.min(100),
        manufacturer,
    }
}

/// Service-based kind, highest priority first.
fn kind_from_services(services: &[Uuid]) -> Option<SensorKind> {
    [
        (gatt::CYCLING_POWER_SERVICE, SensorKind::Power),
        (gatt::FITNESS_MACHINE_SERVICE, SensorKind::Trainer),
        (gatt::CYCLING_SPEED_CADENCE_SERVICE, SensorKind::Cadence),
        (gatt::HEART_RATE_SERVICE, SensorKind::HeartRate),
    ]
    .into_iter()
    .find(|(uuid, _)| services.contains(uuid))
    .map(|(_, kind)| kind)
}

fn service_score(services: &[Uuid]) -> u8 {
    services
        .iter()
        .map(|s| match *s {
            gatt::FITNESS_MACHINE_SERVICE => 95,
            gatt::CYCLING_POWER_SERVICE => 90,
            gatt::CYCLING_SPEED_CADENCE_SERVICE => 85,
            gatt::HEART_RATE_SERVICE => 80,
            _ => 40,
        })
        .max()
        .unwrap_or(0)
}

fn first_match<'t>(table: &'t [Keyword], lowered: &str, words: &[&str]) -> Option<&'t Keyword> {
    table
        .iter()
        .find(|k| matches_keyword(k.text, k.whole_word, lowered, words))
}

fn matches_keyword(text: &str, whole_word: bool, lowered: &str, words: &[&str]) -> bool {
    if whole_word {
        words.contains(&text)
    } else {
        lowered.contains(text)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_service_wins_over_heart_rate() {
        let c = classify(
            Some("Combo"),
            &[gatt::HEART_RATE_SERVICE, gatt::CYCLING_POWER_SERVICE],
            None,
        );
        assert_eq!(c.kind, SensorKind::Power);
        assert_eq!(c.score, 90);
    }

    #[test]
    fn fitness_machine_scores_highest() {
        let c = classify(Some("KICKR CORE 1A2B"), &[gatt::FITNESS_MACHINE_SERVICE], None);
        assert_eq!(c.kind, SensorKind::Trainer);
        assert_eq!(c.score, 95);
    }

    #[test]
    fn keyword_classifies_without_services() {
        let c = classify(Some("HRM-Pro:123"), &[], None);
        assert_eq!(c.kind, SensorKind::HeartRate);
        assert_eq!(c.score, 90);
    }

    #[test]
    fn short_keywords_need_whole_words() {
        let c = classify(Some("Three"), &[], None);
        assert_eq!(c.kind, SensorKind::Unknown);
        assert_eq!(c.score, 10);
    }

    #[test]
    fn brand_without_kind_scores_but_stays_unknown() {
        let c = classify(Some("Wahoo 1234"), &[], None);
        assert_eq!(c.kind, SensorKind::Unknown);
        assert_eq!(c.score, 80);
        assert_eq!(c.manufacturer.as_deref(), Some("Wahoo"));
    }

    #[test]
    fn brand_can_imply_kind() {
        let c = classify(Some("ASSIOMA12345"), &[], None);
        assert_eq!(c.kind, SensorKind::Power);
    }

    #[test]
    fn non_cycling_names_are_penalised() {
        let c = classify(Some("Sam's AirPods Pro"), &[gatt::BATTERY_SERVICE], Some(0x004C));
        assert_eq!(c.kind, SensorKind::Unknown);
        assert_eq!(c.score, 0);
        assert_eq!(c.manufacturer.as_deref(), Some("Apple"));
    }

    #[test]
    fn unknown_service_scores_forty() {
        let c = classify(None, &[gatt::BATTERY_SERVICE], None);
        assert_eq!(c.score, 40);
    }

    #[test]
    fn wholly_unknown_gets_floor() {
        assert_eq!(classify(None, &[], None).score, 10);
    }
}
