//! Generation prompt assembly from garment facts, analyzed parts and the
//! routing decision of the current attempt.

use crate::facts::{GarmentFacts, PartFacts, VisibilityLevel};
use crate::routing::RoutingDecision;

const SYSTEM_BLOCK: &str = "Professional product photography for fashion e-commerce.\n\
Generate a high-fidelity ghost mannequin image that looks like a professional studio shoot.\n\
Follow all specifications exactly.";

#[derive(Debug, Clone, Default)]
pub struct PromptInputs<'a> {
    pub parts: &'a [PartFacts],
    pub custom_additions: Option<&'a str>,
}

pub fn build_generation_prompt(
    facts: &GarmentFacts,
    decision: &RoutingDecision,
    inputs: &PromptInputs<'_>,
) -> String {
    let mut sections = vec![
        String::from("=== SYSTEM ==="),
        SYSTEM_BLOCK.to_string(),
        String::new(),
        String::from("=== GARMENT ==="),
        facts.describe(),
        format!("- Color: {} ({})", facts.color.hex, facts.color.name),
        String::new(),
        ghost_mannequin_section(facts),
    ];

    let parts = part_notes_section(inputs.parts);
    if !parts.is_empty() {
        sections.push(String::new());
        sections.push(parts);
    }

    sections.push(String::new());
    sections.push(routing_section(decision));

    if let Some(extra) = inputs.custom_additions.map(str::trim).filter(|s| !s.is_empty()) {
        sections.push(String::new());
        sections.push(String::from("=== CUSTOM ADDITIONS ==="));
        sections.push(extra.to_string());
    }

    sections.extend([
        String::new(),
        String::from("=== TECHNICAL ==="),
        String::from("- Output: Pure white background, clean alpha edges"),
        String::from("- Quality: Production-ready, marketplace-compliant"),
    ]);
    sections.join("\n")
}

fn ghost_mannequin_section(facts: &GarmentFacts) -> String {
    let mut lines = vec![
        String::from("=== GHOST MANNEQUIN SPECIFICATION ==="),
        String::from("- Create professional ghost mannequin effect (invisible mannequin)"),
    ];
    if facts.interior_visibility == Some(VisibilityLevel::High) {
        lines.push(String::from("- Interior neck/cuff openings must be clearly visible"));
        lines.push(String::from("- Show hollow interior depth with subtle shadows"));
    }
    if facts.transparency_level > 0.5 {
        lines.push(format!(
            "- Preserve fabric transparency ({:.0}%)",
            facts.transparency_level * 100.0
        ));
    }
    lines.push(String::from("- Edge precision: high (no halos, clean alpha)"));
    lines.join("\n")
}

/// Analyzed parts are stated as facts; fallback placeholders only as hints.
fn part_notes_section(parts: &[PartFacts]) -> String {
    if parts.is_empty() {
        return String::new();
    }
    let mut lines = vec![String::from("=== PART NOTES ===")];
    for part in parts.iter().filter(|p| p.analyzed) {
        lines.push(format!(
            "- {}: {} {} {}, condition {}",
            part.part_name.replace('_', " "),
            part.color_hex,
            part.pattern,
            part.texture,
            part.condition
        ));
    }
    let hinted = parts
        .iter()
        .filter(|p| !p.analyzed)
        .map(|p| p.part_name.replace('_', " "))
        .collect::<Vec<_>>();
    if !hinted.is_empty() {
        lines.push(format!(
            "- Hint (unverified): keep {} consistent with the garment",
            hinted.join(", ")
        ));
    }
    lines.join("\n")
}

fn routing_section(decision: &RoutingDecision) -> String {
    let mut lines = vec![String::from("=== RENDERING HINTS ===")];
    if decision.use_auxiliary_conditioning {
        lines.push(format!(
            "- Follow the reference pattern closely (conditioning weight {:.2})",
            decision.conditioning_weight
        ));
    } else {
        lines.push(String::from("- Reference image guides silhouette and color only"));
    }
    if decision.attempt_number > 1 {
        lines.push(format!(
            "- Attempt {}: correct color and garment identity from the reference",
            decision.attempt_number
        ));
    }
    lines.join("\n")
}
