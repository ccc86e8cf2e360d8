use indexmap::IndexMap;
use tracing::{info, warn};

use crate::domain::{Category, StagedLayer};
use crate::error::{Degradation, Stage, Staged};

/// Aliases this short only count when they form a whole token.
const SHORT_ALIAS_LEN: usize = 3;

/// Ordered (category, synonyms) rules evaluated top to bottom; the first
/// category with a matching alias wins.
#[derive(Debug, Clone)]
pub struct ReferenceClassifier {
    rules: Vec<(Category, Vec<String>)>,
}

impl Default for ReferenceClassifier {
    fn default() -> Self {
        Self::new(
            Category::ORDERED
                .iter()
                .map(|category| (*category, category.synonyms().to_vec())),
        )
    }
}

impl ReferenceClassifier {
    pub fn new<'a>(rules: impl IntoIterator<Item = (Category, Vec<&'a str>)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(category, aliases)| {
                    (
                        category,
                        aliases.into_iter().map(str::to_lowercase).collect(),
                    )
                })
                .collect(),
        }
    }

    pub fn classify(&self, folder_name: &str, base_name: &str) -> Option<Category> {
        let haystack = format!("{folder_name} {base_name}").to_lowercase();
        let tokens: Vec<&str> = haystack
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .collect();

        self.rules.iter().find_map(|(category, aliases)| {
            aliases
                .iter()
                .any(|alias| {
                    if alias.chars().count() <= SHORT_ALIAS_LEN {
                        tokens.contains(&alias.as_str())
                    } else {
                        haystack.contains(alias.as_str())
                    }
                })
                .then_some(*category)
        })
    }

    /// Assigns layers to categories in discovery order. A category keeps the
    /// first layer that claimed it; later claimants are reported and dropped.
    pub fn assign(&self, layers: Vec<StagedLayer>) -> Staged<IndexMap<Category, StagedLayer>> {
        let mut assigned: IndexMap<Category, StagedLayer> = IndexMap::new();
        let mut degradations = Vec::new();

        for layer in layers {
            let label = format!("{}/{}", layer.folder_name, layer.base_name);
            match self.classify(&layer.folder_name, &layer.base_name) {
                Some(category) if assigned.contains_key(&category) => {
                    warn!(layer = %label, %category, "category already assigned, ignoring layer");
                    degradations.push(Degradation::for_item(
                        Stage::Classify,
                        label,
                        format!("duplicate candidate for {category}, first discovered layer kept"),
                    ));
                }
                Some(category) => {
                    info!(layer = %label, %category, "reference layer classified");
                    assigned.insert(category, layer);
                }
                None => {
                    warn!(layer = %label, "reference layer matches no category");
                    degradations.push(Degradation::for_item(
                        Stage::Classify,
                        label,
                        "unclassified reference layer",
                    ));
                }
            }
        }

        Staged::with(assigned, degradations)
    }
}
