//! Build Recommendation Engine
//! Mission: Turn match state plus aggregated statistics into one concrete,
//! justified item build.
//!
//! The engine is pure and synchronous: identical inputs always produce the
//! identical recommendation, which is what makes the significance diffing
//! and the test suite trustworthy.

use crate::models::{AggregatedMatchData, MatchContext, Recommendation, TeamComposition};
use anyhow::Result;

const CORE_BUILD_SLOTS: usize = 6;
const SITUATIONAL_SLOTS: usize = 4;

/// Contract against whatever computes recommendations.
pub trait RecommendationEngine: Send + Sync {
    fn recommend(&self, ctx: &MatchContext, data: &AggregatedMatchData) -> Result<Recommendation>;
}

/// Default engine: aggregated popular builds ranked by weighted win rate,
/// composition-aware counters, threat scored from detected enemy items.
pub struct WeightedBuildEngine;

/// Characters dealing primarily magical damage. Anyone not listed is
/// treated as physical for classification purposes.
const MAGICAL_CHARACTERS: &[&str] = &[
    "Zeus", "Ra", "Scylla", "Agni", "Kukulkan", "Poseidon", "Anubis", "Hades", "Hel", "Isis",
    "Vulcan", "Merlin", "Tiamat", "Baron Samedi", "Nox", "Sol", "Thoth", "Morgan Le Fey",
];

/// Stealth or burst-assassin characters that warrant a defensive tell.
const AMBUSH_CHARACTERS: &[&str] = &["Loki", "Serqet", "Ao Kuang", "Susano"];

/// Enemy items that trigger a specific counter purchase.
const HEALING_ITEMS: &[&str] = &["Bancroft's Talon", "Asi", "Bloodforge", "Soul Eater"];
const CRIT_ITEMS: &[&str] = &["Deathbringer", "Rage", "Wind Demon", "Poisoned Star"];
const PEN_ITEMS: &[&str] = &["Jotunn's Wrath", "Titan's Bane", "Obsidian Shard", "Heartseeker"];

/// Fallback builds when no aggregated data is available for a character.
const ROLE_TEMPLATES: &[(&str, &[&str])] = &[
    (
        "Mid",
        &[
            "Conduit Gem",
            "Book of Thoth",
            "Spear of Desolation",
            "Rod of Tahuti",
            "Soul Reaver",
            "Obsidian Shard",
        ],
    ),
    (
        "Carry",
        &[
            "Death's Toll",
            "Devourer's Gauntlet",
            "Ichaival",
            "Qin's Sais",
            "Titan's Bane",
            "Deathbringer",
        ],
    ),
    (
        "Solo",
        &[
            "Warrior's Axe",
            "Gladiator's Shield",
            "Blackthorn Hammer",
            "Mystical Mail",
            "Spirit Robe",
            "Mantle of Discord",
        ],
    ),
    (
        "Support",
        &[
            "Sentinel's Gift",
            "Gauntlet of Thebes",
            "Sovereignty",
            "Heartward Amulet",
            "Spirit Robe",
            "Mantle of Discord",
        ],
    ),
    (
        "Jungle",
        &[
            "Bumba's Dagger",
            "Jotunn's Wrath",
            "Hydra's Lament",
            "Heartseeker",
            "Titan's Bane",
            "Magi's Cloak",
        ],
    ),
];

impl RecommendationEngine for WeightedBuildEngine {
    fn recommend(&self, ctx: &MatchContext, data: &AggregatedMatchData) -> Result<Recommendation> {
        let composition = classify_composition(&ctx.enemy_roster);
        let threat_level = threat_level(ctx);
        let counter_items = counter_items(ctx, composition);
        let core_items = core_build(ctx, data);
        let situational_items = situational_items(data, &core_items);

        // Low-reliability or stale data lowers confidence; it never blocks a
        // recommendation outright.
        let mut confidence = 0.35 + 0.6 * data.weighted_reliability;
        if data.stale {
            confidence *= 0.8;
        }
        let confidence = confidence.clamp(0.2, 0.95);

        let justification = justify(ctx, data, composition, threat_level, &counter_items);

        Ok(Recommendation {
            character: ctx.character.clone(),
            role: ctx.role.clone(),
            core_items,
            situational_items,
            counter_items,
            composition,
            threat_level,
            confidence,
            justification,
        })
    }
}

fn classify_composition(enemy_roster: &[String]) -> TeamComposition {
    if enemy_roster.is_empty() {
        return TeamComposition::Unknown;
    }

    let magical = enemy_roster
        .iter()
        .filter(|name| MAGICAL_CHARACTERS.contains(&name.as_str()))
        .count();
    let total = enemy_roster.len();

    if magical * 3 >= total * 2 {
        TeamComposition::HeavyMagical
    } else if (total - magical) * 3 >= total * 2 {
        TeamComposition::HeavyPhysical
    } else {
        TeamComposition::Balanced
    }
}

/// Threat grows with how far enemy builds have progressed, weighted toward
/// high-impact purchases (crit and penetration).
fn threat_level(ctx: &MatchContext) -> f64 {
    let mut score = 0.0;
    for items in ctx.detected_items.values() {
        for item in items {
            score += if CRIT_ITEMS.contains(&item.as_str())
                || PEN_ITEMS.contains(&item.as_str())
            {
                0.12
            } else {
                0.06
            };
        }
    }

    // A full roster is itself a little more threatening than a partial read.
    score += ctx.enemy_roster.len() as f64 * 0.02;
    score.clamp(0.0, 1.0)
}

fn counter_items(ctx: &MatchContext, composition: TeamComposition) -> Vec<String> {
    let magical_self = MAGICAL_CHARACTERS.contains(&ctx.character.as_str());
    let mut counters: Vec<String> = Vec::new();
    let mut push = |item: &str| {
        if !counters.iter().any(|i| i == item) {
            counters.push(item.to_string());
        }
    };

    let detected: Vec<&str> = ctx
        .detected_items
        .values()
        .flatten()
        .map(String::as_str)
        .collect();

    if detected.iter().any(|i| HEALING_ITEMS.contains(i)) {
        push(if magical_self {
            "Divine Ruin"
        } else {
            "Brawler's Beat Stick"
        });
    }
    if detected.iter().any(|i| CRIT_ITEMS.contains(i)) {
        push("Spectral Armor");
    }
    if ctx
        .enemy_roster
        .iter()
        .any(|name| AMBUSH_CHARACTERS.contains(&name.as_str()))
    {
        push("Mystical Mail");
    }

    match composition {
        TeamComposition::HeavyMagical => push("Magi's Cloak"),
        TeamComposition::HeavyPhysical if detected.iter().any(|i| PEN_ITEMS.contains(i)) => {
            push("Spirit Robe")
        }
        _ => {}
    }

    counters
}

/// Pick the aggregated popular build with the best mean win rate; fall back
/// to the static role template when no data contributed.
fn core_build(ctx: &MatchContext, data: &AggregatedMatchData) -> Vec<String> {
    let best = data
        .popular_builds
        .iter()
        .filter(|build| !build.is_empty())
        .map(|build| {
            let mean: f64 = build
                .iter()
                .map(|item| data.item_win_rates.get(item).copied().unwrap_or(0.5))
                .sum::<f64>()
                / build.len() as f64;
            (build, mean)
        })
        // Strict comparison so ties keep the earlier (more popular) build.
        .fold(None::<(&Vec<String>, f64)>, |best, (build, mean)| match best {
            Some((_, best_mean)) if best_mean >= mean => best,
            _ => Some((build, mean)),
        });

    if let Some((build, _)) = best {
        return build.iter().take(CORE_BUILD_SLOTS).cloned().collect();
    }

    ROLE_TEMPLATES
        .iter()
        .find(|(role, _)| role.eq_ignore_ascii_case(&ctx.role))
        .or_else(|| ROLE_TEMPLATES.first())
        .map(|(_, items)| items.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

fn situational_items(data: &AggregatedMatchData, core: &[String]) -> Vec<String> {
    let mut candidates: Vec<(&String, f64)> = data
        .item_win_rates
        .iter()
        .filter(|(item, _)| !core.contains(item))
        .map(|(item, rate)| (item, *rate))
        .collect();

    // Win rate descending, then name, so output is deterministic.
    candidates.sort_by(|(an, ar), (bn, br)| {
        br.partial_cmp(ar)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| an.cmp(bn))
    });

    candidates
        .into_iter()
        .take(SITUATIONAL_SLOTS)
        .map(|(item, _)| item.clone())
        .collect()
}

fn justify(
    ctx: &MatchContext,
    data: &AggregatedMatchData,
    composition: TeamComposition,
    threat: f64,
    counters: &[String],
) -> String {
    let comp_text = match composition {
        TeamComposition::HeavyMagical => "a heavily magical enemy team",
        TeamComposition::HeavyPhysical => "a heavily physical enemy team",
        TeamComposition::Balanced => "a balanced enemy team",
        TeamComposition::Unknown => "an unknown enemy team",
    };

    let data_text = if data.contributing_sources.is_empty() {
        "role template (no fresh statistics available)".to_string()
    } else {
        format!(
            "{} matches across {} sources",
            data.sample_size,
            data.contributing_sources.len()
        )
    };

    let counter_text = if counters.is_empty() {
        String::new()
    } else {
        format!(" Counter picks: {}.", counters.join(", "))
    };

    format!(
        "{} {} vs {} (threat {:.0}%), built from {}.{}",
        ctx.character,
        ctx.role,
        comp_text,
        threat * 100.0,
        data_text,
        counter_text
    )
}
