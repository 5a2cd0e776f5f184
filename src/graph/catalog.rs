//! The relationship vocabulary: categories, types, inverses.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::models::{Category, CycleDetection, RelationshipType};

/// How an edge of a given type maps onto the normalized edge set used for
/// cycle detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Orientation {
    /// The type is the canonical member of its pair (or has no inverse).
    Forward { canonical: String },
    /// The type is the inverse of `canonical`; the edge runs the other way.
    Reversed { canonical: String },
    /// Symmetric type; it imposes no ordering and never closes a cycle.
    Symmetric,
}

/// Immutable, validated view of the configured relationship types.
#[derive(Debug, Clone)]
pub struct Catalog {
    categories: Vec<Category>,
    types: Vec<RelationshipType>,
    by_name: HashMap<String, usize>,
    orientation: HashMap<String, Orientation>,
}

impl Catalog {
    pub fn new(categories: Vec<Category>, types: Vec<RelationshipType>) -> Result<Self> {
        let mut by_name = HashMap::new();
        for (i, ty) in types.iter().enumerate() {
            if by_name.insert(ty.name.clone(), i).is_some() {
                return Err(Error::Config(format!(
                    "relationship type {} declared twice",
                    ty.name
                )));
            }
            if !categories.iter().any(|c| c.name == ty.category) {
                return Err(Error::Config(format!(
                    "relationship type {} names unknown category {}",
                    ty.name, ty.category
                )));
            }
        }

        let mut orientation = HashMap::new();
        for (i, ty) in types.iter().enumerate() {
            if ty.bidirectional {
                if ty.inverse.is_some() {
                    return Err(Error::Config(format!(
                        "bidirectional type {} cannot declare an inverse",
                        ty.name
                    )));
                }
                orientation.insert(ty.name.clone(), Orientation::Symmetric);
                continue;
            }
            let Some(inverse) = &ty.inverse else {
                orientation.insert(
                    ty.name.clone(),
                    Orientation::Forward {
                        canonical: ty.name.clone(),
                    },
                );
                continue;
            };
            let Some(&j) = by_name.get(inverse) else {
                return Err(Error::Config(format!(
                    "relationship type {} names unknown inverse {}",
                    ty.name, inverse
                )));
            };
            let other = &types[j];
            if other.inverse.as_deref() != Some(ty.name.as_str()) {
                return Err(Error::Config(format!(
                    "inverse of {} is {}, but {} does not point back",
                    ty.name, inverse, inverse
                )));
            }
            if other.category != ty.category {
                return Err(Error::Config(format!(
                    "{} and its inverse {} are in different categories",
                    ty.name, inverse
                )));
            }
            // The member declared first is canonical.
            let entry = if i <= j {
                Orientation::Forward {
                    canonical: ty.name.clone(),
                }
            } else {
                Orientation::Reversed {
                    canonical: other.name.clone(),
                }
            };
            orientation.insert(ty.name.clone(), entry);
        }

        Ok(Self {
            categories,
            types,
            by_name,
            orientation,
        })
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn types(&self) -> &[RelationshipType] {
        &self.types
    }

    pub fn get(&self, name: &str) -> Option<&RelationshipType> {
        self.by_name.get(name).map(|&i| &self.types[i])
    }

    pub fn relationship_type(&self, name: &str) -> Result<&RelationshipType> {
        self.get(name)
            .ok_or_else(|| Error::UnknownRelationshipType(name.to_string()))
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// Category of a type. Types are validated against categories on
    /// construction, so this only fails for unknown type names.
    pub fn category_of(&self, type_name: &str) -> Result<&Category> {
        let ty = self.relationship_type(type_name)?;
        self.category(&ty.category)
            .ok_or_else(|| Error::Config(format!("unknown category {}", ty.category)))
    }

    /// Type of the record written on the target when `type_name` is linked:
    /// the declared inverse, the type itself when bidirectional, or none.
    pub fn complement(&self, type_name: &str) -> Option<&str> {
        let ty = self.get(type_name)?;
        if ty.bidirectional {
            Some(ty.name.as_str())
        } else {
            ty.inverse.as_deref()
        }
    }

    pub fn orientation(&self, type_name: &str) -> Option<&Orientation> {
        self.orientation.get(type_name)
    }

    /// Names of all types in `category`.
    pub fn types_in(&self, category: &str) -> Vec<&str> {
        self.types
            .iter()
            .filter(|t| t.category == category)
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Categories whose effective policy checks for cycles.
    pub fn checked_categories(&self) -> impl Iterator<Item = &Category> {
        self.categories
            .iter()
            .filter(|c| c.effective_detection() != CycleDetection::None)
    }
}
