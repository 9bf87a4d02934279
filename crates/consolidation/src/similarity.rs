//! Similarity primitives: string, phonetic, trigram, embedding, graph.
//!
//! Everything here is pure math over in-memory values; the services in
//! `kmapper-infra` fetch vectors and neighborhoods and delegate the
//! arithmetic here.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

use kmapper_core::{EntityId, PageId, TenantId};

/// The slice of an extracted entity that similarity scoring needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub name: String,
    pub normalized_name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub source_page_id: Option<PageId>,
    pub is_canonical: bool,
}

/// String and contextual feature scores, all in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StringScores {
    pub jaro_winkler: f64,
    pub normalized_exact: f64,
    pub soundex_match: f64,
    pub trigram_similarity: f64,
    pub type_match: f64,
    pub same_page: f64,
}

/// Compute the fast string/phonetic/contextual feature set for a pair.
pub fn compute_string_scores(a: &EntityView, b: &EntityView) -> StringScores {
    StringScores {
        jaro_winkler: jaro_winkler(&a.name, &b.name),
        normalized_exact: if !a.normalized_name.is_empty() && a.normalized_name == b.normalized_name
        {
            1.0
        } else {
            0.0
        },
        soundex_match: {
            let sa = soundex(&a.name);
            let sb = soundex(&b.name);
            if !sa.is_empty() && sa == sb { 1.0 } else { 0.0 }
        },
        trigram_similarity: trigram_similarity(&a.normalized_name, &b.normalized_name),
        type_match: if a.entity_type == b.entity_type { 1.0 } else { 0.0 },
        same_page: match (a.source_page_id, b.source_page_id) {
            (Some(pa), Some(pb)) if pa == pb => 1.0,
            _ => 0.0,
        },
    }
}

/// American Soundex, compatible with the postgres `soundex()` function that
/// backs the generated blocking column: first letter plus three digits,
/// vowels reset the previous code, `h`/`w` do not.
pub fn soundex(name: &str) -> String {
    let letters: Vec<char> = name
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let Some(&first) = letters.first() else {
        return String::new();
    };

    fn code(c: char) -> Option<u8> {
        match c {
            'B' | 'F' | 'P' | 'V' => Some(1),
            'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some(2),
            'D' | 'T' => Some(3),
            'L' => Some(4),
            'M' | 'N' => Some(5),
            'R' => Some(6),
            _ => None,
        }
    }

    let mut out = String::with_capacity(4);
    out.push(first);
    let mut previous = code(first);

    for &c in &letters[1..] {
        match code(c) {
            Some(digit) => {
                if previous != Some(digit) {
                    out.push(char::from(b'0' + digit));
                    if out.len() == 4 {
                        break;
                    }
                }
                previous = Some(digit);
            }
            None => {
                // Vowels separate duplicate codes; H and W are transparent.
                if !matches!(c, 'H' | 'W') {
                    previous = None;
                }
            }
        }
    }

    while out.len() < 4 {
        out.push('0');
    }
    out
}

/// pg_trgm-style trigram similarity: pad with two leading and one trailing
/// space, Jaccard over the trigram sets.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);

    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }

    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return HashSet::new();
    }

    let mut out = HashSet::new();
    for word in lowered.split_whitespace() {
        let padded: Vec<char> = std::iter::repeat_n(' ', 2)
            .chain(word.chars())
            .chain(std::iter::once(' '))
            .collect();
        for window in padded.windows(3) {
            out.insert([window[0], window[1], window[2]]);
        }
    }
    out
}

/// Text representation used for embedding an entity:
/// `"<name> [<type>] <description (truncated)>"`.
pub fn entity_to_text(entity: &EntityView, max_description_chars: usize) -> String {
    let mut parts = vec![entity.name.clone()];

    if !entity.entity_type.is_empty() {
        parts.push(format!("[{}]", entity.entity_type));
    }

    if let Some(description) = &entity.description {
        if description.chars().count() > max_description_chars {
            let truncated: String = description.chars().take(max_description_chars).collect();
            parts.push(format!("{truncated}..."));
        } else {
            parts.push(description.clone());
        }
    }

    parts.join(" ")
}

/// Cosine similarity in [-1, 1]; zero-norm vectors yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Normalize cosine from [-1, 1] into [0, 1].
pub fn normalized_cosine(a: &[f32], b: &[f32]) -> f64 {
    (cosine_similarity(a, b) + 1.0) / 2.0
}

/// An entity's immediate neighborhood in the graph store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphNeighborhood {
    pub entity_id: Option<EntityId>,
    pub outgoing_neighbors: HashSet<EntityId>,
    pub incoming_neighbors: HashSet<EntityId>,
    /// neighbor id → relationship type (first seen wins).
    pub relationship_types: HashMap<EntityId, String>,
}

impl GraphNeighborhood {
    pub fn all_neighbors(&self) -> HashSet<EntityId> {
        self.outgoing_neighbors
            .union(&self.incoming_neighbors)
            .copied()
            .collect()
    }

    pub fn relationship_type_set(&self) -> HashSet<&str> {
        self.relationship_types.values().map(String::as_str).collect()
    }
}

/// Jaccard over two sets; two empty sets yield the neutral 0.5 so entities
/// without relationships are not penalized to zero.
pub fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.5;
    }

    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Combined graph score: `0.7 * jaccard(neighbors) + 0.3 * jaccard(rel types)`.
pub fn graph_similarity(a: &GraphNeighborhood, b: &GraphNeighborhood) -> f64 {
    let neighbor_jaccard = jaccard(&a.all_neighbors(), &b.all_neighbors());
    let type_jaccard = jaccard(&a.relationship_type_set(), &b.relationship_type_set());
    neighbor_jaccard * 0.7 + type_jaccard * 0.3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str, entity_type: &str) -> EntityView {
        EntityView {
            id: EntityId::new(),
            tenant_id: TenantId::new(),
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            entity_type: entity_type.to_string(),
            description: None,
            source_page_id: None,
            is_canonical: true,
        }
    }

    #[test]
    fn soundex_matches_reference_codes() {
        assert_eq!(soundex("Robert"), "R163");
        assert_eq!(soundex("Rupert"), "R163");
        assert_eq!(soundex("Tymczak"), "T522");
        assert_eq!(soundex("Pfister"), "P236");
        assert_eq!(soundex("Honeyman"), "H555");
        assert_eq!(soundex("Ashcraft"), "A261");
        assert_eq!(soundex(""), "");
        assert_eq!(soundex("123"), "");
    }

    #[test]
    fn identical_entities_score_one_on_string_features() {
        let a = view("ACME Corp", "ORG");
        let mut b = view("ACME Corp", "ORG");
        b.id = EntityId::new();

        let scores = compute_string_scores(&a, &b);
        assert_eq!(scores.jaro_winkler, 1.0);
        assert_eq!(scores.normalized_exact, 1.0);
        assert_eq!(scores.soundex_match, 1.0);
        assert_eq!(scores.type_match, 1.0);
        assert!((scores.trigram_similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn different_types_zero_the_type_feature() {
        let scores = compute_string_scores(&view("Mercury", "PLANET"), &view("Mercury", "ELEMENT"));
        assert_eq!(scores.type_match, 0.0);
        assert_eq!(scores.normalized_exact, 1.0);
    }

    #[test]
    fn same_page_boost_requires_both_pages() {
        let page = PageId::new();
        let mut a = view("A", "X");
        let mut b = view("B", "X");
        a.source_page_id = Some(page);
        b.source_page_id = Some(page);
        assert_eq!(compute_string_scores(&a, &b).same_page, 1.0);

        b.source_page_id = Some(PageId::new());
        assert_eq!(compute_string_scores(&a, &b).same_page, 0.0);
    }

    #[test]
    fn trigram_similarity_bounds() {
        assert_eq!(trigram_similarity("", ""), 0.0);
        assert!((trigram_similarity("word", "word") - 1.0).abs() < 1e-9);
        let partial = trigram_similarity("acme corp", "acme corporation");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn entity_to_text_truncates_description() {
        let mut entity = view("Rust", "LANGUAGE");
        entity.description = Some("x".repeat(600));

        let text = entity_to_text(&entity, 500);
        assert!(text.starts_with("Rust [LANGUAGE] "));
        assert!(text.ends_with("..."));
        assert_eq!(text.chars().count(), "Rust [LANGUAGE] ".chars().count() + 503);
    }

    #[test]
    fn cosine_similarity_reference_values() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((normalized_cosine(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_neighborhoods_are_neutral() {
        let a = GraphNeighborhood::default();
        let b = GraphNeighborhood::default();
        assert!((graph_similarity(&a, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn shared_neighbors_raise_graph_similarity() {
        let shared = EntityId::new();
        let mut a = GraphNeighborhood::default();
        let mut b = GraphNeighborhood::default();
        a.outgoing_neighbors.insert(shared);
        b.incoming_neighbors.insert(shared);
        a.relationship_types.insert(shared, "KNOWS".to_string());
        b.relationship_types.insert(shared, "KNOWS".to_string());

        assert!((graph_similarity(&a, &b) - 1.0).abs() < 1e-9);

        b.outgoing_neighbors.insert(EntityId::new());
        assert!(graph_similarity(&a, &b) < 1.0);
    }
}
