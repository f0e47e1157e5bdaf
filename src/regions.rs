use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HierarchyError {
    #[error("malformed hierarchy: first row {label:?} is not a region header")]
    MalformedHierarchy { label: String },

    #[error("malformed hierarchy: no rows")]
    Empty,
}

/// Population figures are in millions.
#[derive(Debug, Clone, PartialEq)]
pub struct CountryPopulation {
    pub name: String,
    pub population: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionEntry {
    /// Header label exactly as it appears in the source.
    pub name: String,
    /// The header row's own figure (an aggregate, not a member sum).
    pub reported_population: f64,
    pub countries: Vec<CountryPopulation>,
}

impl RegionEntry {
    pub fn member_population(&self) -> f64 {
        self.countries.iter().map(|c| c.population).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub region: String,
    pub population: f64,
}

/// A country listed under more than one header. The later header wins the lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCountry {
    pub country: String,
    pub shadowed_region: String,
    pub winning_region: String,
}

/// Region → members table plus the flattened country → (region, population) lookup.
///
/// Membership is direct only: a country belongs to the nearest header above it.
/// Enclosing aggregates such as WORLD get no rolled-up member list, since the
/// flat file does not say which headers nest inside which.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: Vec<RegionEntry>,
    index: HashMap<String, usize>,
    countries: HashMap<String, Placement>,
    duplicates: Vec<DuplicateCountry>,
}

/// ALL-CAPS labels with at least one letter are region headers.
pub fn is_region_header(label: &str) -> bool {
    label.chars().any(char::is_alphabetic) && !label.chars().any(char::is_lowercase)
}

impl RegionTable {
    /// Fold ordered `(label, population)` rows into the table. Every mixed-case
    /// row belongs to the most recent header above it.
    pub fn parse<I, S>(rows: I) -> Result<Self, HierarchyError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        let mut table = RegionTable::default();
        let mut current: Option<usize> = None;

        for (label, population) in rows {
            let label = label.as_ref().trim();

            if is_region_header(label) {
                current = Some(table.open_region(label, population));
                continue;
            }

            let Some(region_idx) = current else {
                return Err(HierarchyError::MalformedHierarchy {
                    label: label.to_string(),
                });
            };

            table.place_country(region_idx, label, population);
        }

        if current.is_none() {
            return Err(HierarchyError::Empty);
        }
        Ok(table)
    }

    /// Returns the index of the region, merging repeated headers into the first entry.
    fn open_region(&mut self, name: &str, population: f64) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.regions.len();
        self.regions.push(RegionEntry {
            name: name.to_string(),
            reported_population: population,
            countries: Vec::new(),
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn place_country(&mut self, region_idx: usize, country: &str, population: f64) {
        let region = &mut self.regions[region_idx];
        region.countries.push(CountryPopulation {
            name: country.to_string(),
            population,
        });

        let placement = Placement {
            region: region.name.clone(),
            population,
        };
        if let Some(previous) = self.countries.insert(country.to_string(), placement) {
            warn!(
                country,
                shadowed = %previous.region,
                winner = %region.name,
                "Country listed under more than one region; last one wins"
            );
            self.duplicates.push(DuplicateCountry {
                country: country.to_string(),
                shadowed_region: previous.region,
                winning_region: region.name.clone(),
            });
        }
    }

    pub fn lookup(&self, country: &str) -> Option<&Placement> {
        self.countries.get(country)
    }

    pub fn region(&self, name: &str) -> Option<&RegionEntry> {
        self.index.get(name).map(|&idx| &self.regions[idx])
    }

    /// Regions in the order their headers first appeared.
    pub fn regions(&self) -> &[RegionEntry] {
        &self.regions
    }

    pub fn duplicates(&self) -> &[DuplicateCountry] {
        &self.duplicates
    }

    pub fn country_count(&self) -> usize {
        self.countries.len()
    }
}

// ── Tests ──
