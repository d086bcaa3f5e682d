//! # Viseme Types
//!
//! Visemes are the mouth shapes a rendering engine knows how to deform a face
//! toward. The identifiers follow the Oculus viseme set (`viseme_aa`,
//! `viseme_PP`, ...) because that is what the avatar meshes ship with.
//!
//! ## Key Types:
//! - **Viseme**: closed set of the 15 mouth shapes
//! - **VisemeWeightSet**: viseme → weight map, every weight clamped to [0, 1]
//! - **ScheduledVisemeEvent**: a weight set with a start offset and a duration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One mouth shape. Serialized with the mesh morph-target name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Viseme {
    #[serde(rename = "viseme_sil")]
    Sil,
    #[serde(rename = "viseme_PP")]
    PP,
    #[serde(rename = "viseme_FF")]
    FF,
    #[serde(rename = "viseme_TH")]
    TH,
    #[serde(rename = "viseme_DD")]
    DD,
    #[serde(rename = "viseme_kk")]
    Kk,
    #[serde(rename = "viseme_CH")]
    CH,
    #[serde(rename = "viseme_SS")]
    SS,
    #[serde(rename = "viseme_nn")]
    Nn,
    #[serde(rename = "viseme_RR")]
    RR,
    #[serde(rename = "viseme_aa")]
    Aa,
    #[serde(rename = "viseme_E")]
    E,
    #[serde(rename = "viseme_I")]
    I,
    #[serde(rename = "viseme_O")]
    O,
    #[serde(rename = "viseme_U")]
    U,
}

impl Viseme {
    pub const ALL: [Viseme; 15] = [
        Viseme::Sil,
        Viseme::PP,
        Viseme::FF,
        Viseme::TH,
        Viseme::DD,
        Viseme::Kk,
        Viseme::CH,
        Viseme::SS,
        Viseme::Nn,
        Viseme::RR,
        Viseme::Aa,
        Viseme::E,
        Viseme::I,
        Viseme::O,
        Viseme::U,
    ];

    /// Morph-target name as the rendering sink expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Viseme::Sil => "viseme_sil",
            Viseme::PP => "viseme_PP",
            Viseme::FF => "viseme_FF",
            Viseme::TH => "viseme_TH",
            Viseme::DD => "viseme_DD",
            Viseme::Kk => "viseme_kk",
            Viseme::CH => "viseme_CH",
            Viseme::SS => "viseme_SS",
            Viseme::Nn => "viseme_nn",
            Viseme::RR => "viseme_RR",
            Viseme::Aa => "viseme_aa",
            Viseme::E => "viseme_E",
            Viseme::I => "viseme_I",
            Viseme::O => "viseme_O",
            Viseme::U => "viseme_U",
        }
    }

    /// Whether this shape belongs to a vowel sound.
    pub fn is_vowel(&self) -> bool {
        matches!(self, Viseme::Aa | Viseme::E | Viseme::I | Viseme::O | Viseme::U)
    }
}

impl fmt::Display for Viseme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Viseme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Viseme::ALL
            .iter()
            .copied()
            .find(|viseme| viseme.as_str() == s)
            .ok_or_else(|| format!("Unknown viseme: {}", s))
    }
}

/// Clamp a weight into [0, 1]. NaN collapses to 0.
pub fn clamp_weight(weight: f32) -> f32 {
    if weight.is_nan() {
        0.0
    } else {
        weight.clamp(0.0, 1.0)
    }
}

/// Mapping from viseme to weight.
///
/// ## Invariants:
/// - Every stored weight lies in [0, 1]; out-of-range input is clamped, never rejected
/// - Weight sets produced by the analyzer are either all zero (silence) or sum to 1
///
/// A `BTreeMap` keeps iteration order stable, which keeps emitted updates
/// deterministic across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisemeWeightSet(BTreeMap<Viseme, f32>);

impl VisemeWeightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from raw pairs, clamping every weight.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Viseme, f32)>,
    {
        let mut set = Self::new();
        for (viseme, weight) in pairs {
            set.insert(viseme, weight);
        }
        set
    }

    /// A set naming a single viseme at full weight.
    pub fn single(viseme: Viseme) -> Self {
        Self::from_pairs([(viseme, 1.0)])
    }

    pub fn insert(&mut self, viseme: Viseme, weight: f32) {
        self.0.insert(viseme, clamp_weight(weight));
    }

    pub fn get(&self, viseme: Viseme) -> f32 {
        self.0.get(&viseme).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Viseme, f32)> + '_ {
        self.0.iter().map(|(viseme, weight)| (*viseme, *weight))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f32 {
        self.0.values().sum()
    }

    /// True when every weight is zero.
    pub fn is_silent(&self) -> bool {
        self.0.values().all(|weight| *weight == 0.0)
    }

    /// Scale the weights so they sum to 1. A silent set stays all zero.
    pub fn normalized(&self) -> Self {
        let total = self.sum();
        if total <= 0.0 {
            return self.clone();
        }
        Self(
            self.0
                .iter()
                .map(|(viseme, weight)| (*viseme, clamp_weight(weight / total)))
                .collect(),
        )
    }

    /// Viseme carrying the largest weight, if any weight is non-zero.
    pub fn dominant(&self) -> Option<(Viseme, f32)> {
        self.iter()
            .filter(|(_, weight)| *weight > 0.0)
            .fold(None, |best: Option<(Viseme, f32)>, (viseme, weight)| match best {
                Some((_, best_weight)) if best_weight >= weight => best,
                _ => Some((viseme, weight)),
            })
    }
}

/// A weight set shown for `duration` by the discrete scheduling mode.
///
/// `start` is the event's nominal offset within its utterance. Discrete
/// playback is tick-paced: the scheduler fires one event per tick in queue
/// order and only reads `start` for tracing, so a slow tick stretches the
/// utterance instead of skipping events.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledVisemeEvent {
    pub weights: VisemeWeightSet,
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledVisemeEvent {
    pub fn new(weights: VisemeWeightSet, start: Duration, duration: Duration) -> Self {
        Self {
            weights,
            start,
            duration,
        }
    }
}
