use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub type Identity = String;
pub type ParticipantName = String;

/// Shuffles tried before a derangement search gives up.
pub const MAX_DERANGEMENT_ATTEMPTS: usize = 2000;

const DEFAULT_NAMES: [&str; 14] = [
    "Graciele",
    "Daniel",
    "Jeisiele",
    "Maria aparecida",
    "Lucas",
    "Adrieli",
    "Marcilene",
    "Danilo",
    "Eva Maria",
    "Jonatas",
    "Luana",
    "Cleselene",
    "Gabriel",
    "asafe",
];
const DEFAULT_FORCED_PAIR: (&str, &str) = ("Daniel", "Graciele");

/// Storage key derived from a participant name: lowercased, accents
/// stripped, whitespace runs collapsed to `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NameKey(String);

impl NameKey {
    pub fn from_name(name: &str) -> Self {
        let folded: String = name
            .trim()
            .to_lowercase()
            .nfd()
            .filter(|c| !is_combining_mark(*c))
            .collect();
        Self(folded.split_whitespace().collect::<Vec<_>>().join("-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster has no participants")]
    Empty,
    #[error("blank participant name")]
    BlankName,
    #[error("duplicate participant {0:?}")]
    DuplicateName(String),
    #[error("{first:?} and {second:?} both normalize to key {key}")]
    KeyCollision {
        first: String,
        second: String,
        key: NameKey,
    },
    #[error("forced pair member {0:?} is not on the roster")]
    ForcedPairNotInRoster(String),
    #[error("forced pair must name two different participants")]
    ForcedPairNotDistinct,
}

/// Serialized roster layout, as read from a roster file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterDefinition {
    pub names: Vec<ParticipantName>,
    pub forced_pair: (ParticipantName, ParticipantName),
}

/// The closed set of participants plus the pair that must draw each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    names: Vec<ParticipantName>,
    keys: HashMap<NameKey, usize>,
    forced_pair: (ParticipantName, ParticipantName),
}

impl Roster {
    pub fn new(
        names: Vec<ParticipantName>,
        forced_a: impl Into<String>,
        forced_b: impl Into<String>,
    ) -> Result<Self, RosterError> {
        if names.is_empty() {
            return Err(RosterError::Empty);
        }

        let mut seen = HashSet::new();
        let mut keys: HashMap<NameKey, usize> = HashMap::new();
        for (index, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(RosterError::BlankName);
            }
            if !seen.insert(name.clone()) {
                return Err(RosterError::DuplicateName(name.clone()));
            }
            let key = NameKey::from_name(name);
            if let Some(&other) = keys.get(&key) {
                return Err(RosterError::KeyCollision {
                    first: names[other].clone(),
                    second: name.clone(),
                    key,
                });
            }
            keys.insert(key, index);
        }

        let forced_a = forced_a.into();
        let forced_b = forced_b.into();
        for member in [&forced_a, &forced_b] {
            if !seen.contains(member) {
                return Err(RosterError::ForcedPairNotInRoster(member.clone()));
            }
        }
        if forced_a == forced_b {
            return Err(RosterError::ForcedPairNotDistinct);
        }

        Ok(Self {
            names,
            keys,
            forced_pair: (forced_a, forced_b),
        })
    }

    /// Names in roster order.
    pub fn names(&self) -> &[ParticipantName] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn forced_pair(&self) -> (&str, &str) {
        (&self.forced_pair.0, &self.forced_pair.1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Key for a roster member; `None` for names outside the roster.
    pub fn key_of(&self, name: &str) -> Option<NameKey> {
        self.contains(name).then(|| NameKey::from_name(name))
    }

    pub fn name_for_key(&self, key: &NameKey) -> Option<&str> {
        self.keys.get(key).map(|&index| self.names[index].as_str())
    }

    /// Roster members outside the forced pair, in roster order.
    pub fn remainder(&self) -> Vec<&str> {
        self.names
            .iter()
            .filter(|n| **n != self.forced_pair.0 && **n != self.forced_pair.1)
            .map(String::as_str)
            .collect()
    }

    /// Names sorted for a selection list.
    pub fn display_order(&self) -> Vec<&str> {
        let mut sorted: Vec<&str> = self.names.iter().map(String::as_str).collect();
        sorted.sort_by_cached_key(|n| (NameKey::from_name(n), n.to_string()));
        sorted
    }
}

impl Default for Roster {
    fn default() -> Self {
        let names = DEFAULT_NAMES.iter().map(|n| n.to_string()).collect();
        Self::new(names, DEFAULT_FORCED_PAIR.0, DEFAULT_FORCED_PAIR.1)
            .unwrap_or_else(|err| unreachable!("built-in roster is valid: {err}"))
    }
}

impl TryFrom<RosterDefinition> for Roster {
    type Error = RosterError;

    fn try_from(def: RosterDefinition) -> Result<Self, Self::Error> {
        Self::new(def.names, def.forced_pair.0, def.forced_pair.1)
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no derangement of {size} names found after {attempts} attempts")]
pub struct GenerationFailure {
    pub size: usize,
    pub attempts: usize,
}

/// Returns a permutation of `items` in which no element stays at its own
/// position, retrying uniform shuffles up to [`MAX_DERANGEMENT_ATTEMPTS`].
pub fn derange<T, R>(items: &[T], rng: &mut R) -> Result<Vec<T>, GenerationFailure>
where
    T: Clone + PartialEq,
    R: Rng + ?Sized,
{
    derange_within(items, rng, MAX_DERANGEMENT_ATTEMPTS)
}

pub fn derange_within<T, R>(
    items: &[T],
    rng: &mut R,
    max_attempts: usize,
) -> Result<Vec<T>, GenerationFailure>
where
    T: Clone + PartialEq,
    R: Rng + ?Sized,
{
    for _ in 0..max_attempts {
        let mut perm = items.to_vec();
        perm.shuffle(rng);
        if perm.iter().zip(items).all(|(drawn, own)| drawn != own) {
            return Ok(perm);
        }
    }
    Err(GenerationFailure {
        size: items.len(),
        attempts: max_attempts,
    })
}

/// Giver -> recipient for every roster name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    recipients: BTreeMap<ParticipantName, ParticipantName>,
}

impl Assignment {
    pub fn recipient_of(&self, name: &str) -> Option<&str> {
        self.recipients.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.recipients
            .iter()
            .map(|(giver, recipient)| (giver.as_str(), recipient.as_str()))
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Every name mapped, nobody draws themselves, the forced pair draws each
    /// other and the remainder is a permutation of itself.
    pub fn is_valid_for(&self, roster: &Roster) -> bool {
        if self.recipients.len() != roster.len() {
            return false;
        }
        let all_mapped = roster.names().iter().all(|name| {
            matches!(self.recipient_of(name), Some(r) if r != name.as_str() && roster.contains(r))
        });
        if !all_mapped {
            return false;
        }

        let (a, b) = roster.forced_pair();
        if self.recipient_of(a) != Some(b) || self.recipient_of(b) != Some(a) {
            return false;
        }

        let remainder = roster.remainder();
        let mut drawn: Vec<&str> = remainder
            .iter()
            .filter_map(|name| self.recipient_of(name))
            .collect();
        let mut expected = remainder.clone();
        drawn.sort_unstable();
        expected.sort_unstable();
        drawn == expected
    }
}

/// Draws a full assignment: the forced pair mapped to each other and the
/// remaining names mapped through a derangement of themselves.
pub fn build_assignment<R>(roster: &Roster, rng: &mut R) -> Result<Assignment, GenerationFailure>
where
    R: Rng + ?Sized,
{
    let others = roster.remainder();
    let perm = derange(&others[..], rng)?;

    let (a, b) = roster.forced_pair();
    let mut recipients = BTreeMap::new();
    recipients.insert(a.to_string(), b.to_string());
    recipients.insert(b.to_string(), a.to_string());
    for (giver, recipient) in others.iter().zip(perm) {
        recipients.insert(giver.to_string(), recipient.to_string());
    }

    Ok(Assignment { recipients })
}
