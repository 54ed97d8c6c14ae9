use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::error::{RmcError, Result};
use crate::engine::group::Group;

/// Chooses which group is perturbed at each step.
///
/// Selectors return a position in the engine's group list. Groups that are
/// disabled or carry no generator are never returned; when nothing is left to
/// choose from the selector fails with `SelectionExhausted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum GroupSelector {
    /// Uniform over selectable groups.
    Random,
    /// Proportional to `weights[position]`, normalized over selectable groups.
    Weighted { weights: Vec<f64> },
    /// Round robin over `order` (all groups in list order when empty).
    DefinedOrder {
        order: Vec<usize>,
        #[serde(default)]
        cursor: usize,
    },
    /// Re-emits the group chosen by `inner` for `recur` consecutive steps,
    /// or until [`GroupSelector::signal_converged`] is called.
    Recursive {
        inner: Box<GroupSelector>,
        recur: usize,
        #[serde(default)]
        current: Option<usize>,
        #[serde(default)]
        remaining: usize,
    },
}

impl Default for GroupSelector {
    fn default() -> Self {
        GroupSelector::Random
    }
}

fn check_weights(weights: &[f64]) -> Result<()> {
    if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(RmcError::Configuration(format!(
            "selection weight {} must be finite and non-negative",
            w
        )));
    }
    Ok(())
}

fn exhausted(policy: &str) -> RmcError {
    RmcError::SelectionExhausted(format!(
        "{} selector found no enabled group with a move generator",
        policy
    ))
}

impl GroupSelector {
    pub fn weighted(weights: Vec<f64>) -> Result<Self> {
        check_weights(&weights)?;
        Ok(GroupSelector::Weighted { weights })
    }

    pub fn defined_order(order: Vec<usize>) -> Self {
        GroupSelector::DefinedOrder { order, cursor: 0 }
    }

    pub fn recursive(inner: GroupSelector, recur: usize) -> Result<Self> {
        if recur == 0 {
            return Err(RmcError::Configuration(
                "recursive selector needs recur >= 1".to_string(),
            ));
        }
        Ok(GroupSelector::Recursive {
            inner: Box::new(inner),
            recur,
            current: None,
            remaining: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            GroupSelector::Random => "Random",
            GroupSelector::Weighted { .. } => "Weighted",
            GroupSelector::DefinedOrder { .. } => "DefinedOrder",
            GroupSelector::Recursive { .. } => "Recursive",
        }
    }

    /// Checks the selector's tables against the current number of groups.
    pub fn validate(&self, num_groups: usize) -> Result<()> {
        match self {
            GroupSelector::Random => Ok(()),
            GroupSelector::Weighted { weights } => {
                check_weights(weights)?;
                if weights.len() != num_groups {
                    return Err(RmcError::Configuration(format!(
                        "{} selection weights for {} groups",
                        weights.len(),
                        num_groups
                    )));
                }
                Ok(())
            }
            GroupSelector::DefinedOrder { order, .. } => {
                match order.iter().find(|&&g| g >= num_groups) {
                    Some(g) => Err(RmcError::Configuration(format!(
                        "defined order refers to group {} but only {} groups exist",
                        g, num_groups
                    ))),
                    None => Ok(()),
                }
            }
            GroupSelector::Recursive { inner, recur, .. } => {
                if *recur == 0 {
                    return Err(RmcError::Configuration(
                        "recursive selector needs recur >= 1".to_string(),
                    ));
                }
                inner.validate(num_groups)
            }
        }
    }

    /// Replaces the weight table. Normalization happens at selection time.
    pub fn set_weights(&mut self, new_weights: Vec<f64>) -> Result<()> {
        match self {
            GroupSelector::Weighted { weights } => {
                check_weights(&new_weights)?;
                *weights = new_weights;
                Ok(())
            }
            GroupSelector::Recursive { inner, .. } => inner.set_weights(new_weights),
            _ => Err(RmcError::Configuration(format!(
                "{} selector has no weights",
                self.name()
            ))),
        }
    }

    /// Ends the current recursion so the next call picks a fresh group.
    pub fn signal_converged(&mut self) {
        if let GroupSelector::Recursive {
            current, remaining, ..
        } = self
        {
            *current = None;
            *remaining = 0;
        }
    }

    /// Drops cursors and recursion state, e.g. after the group list changed.
    pub fn reset(&mut self) {
        match self {
            GroupSelector::DefinedOrder { cursor, .. } => *cursor = 0,
            GroupSelector::Recursive {
                inner,
                current,
                remaining,
                ..
            } => {
                *current = None;
                *remaining = 0;
                inner.reset();
            }
            _ => {}
        }
    }

    pub fn select<R: Rng + ?Sized>(&mut self, groups: &[Group], rng: &mut R) -> Result<usize> {
        match self {
            GroupSelector::Random => {
                let selectable: Vec<usize> = groups
                    .iter()
                    .enumerate()
                    .filter(|(_, g)| g.is_selectable())
                    .map(|(i, _)| i)
                    .collect();
                if selectable.is_empty() {
                    return Err(exhausted("Random"));
                }
                Ok(selectable[rng.gen_range(0..selectable.len())])
            }
            GroupSelector::Weighted { weights } => {
                let total: f64 = groups
                    .iter()
                    .zip(weights.iter())
                    .filter(|(g, _)| g.is_selectable())
                    .map(|(_, w)| *w)
                    .sum();
                if total <= 0.0 {
                    return Err(exhausted("Weighted"));
                }
                let target = rng.gen::<f64>() * total;
                let mut acc = 0.0;
                let mut last = None;
                for (i, (g, w)) in groups.iter().zip(weights.iter()).enumerate() {
                    if !g.is_selectable() || *w <= 0.0 {
                        continue;
                    }
                    acc += *w;
                    last = Some(i);
                    if target < acc {
                        return Ok(i);
                    }
                }
                // Rounding can leave `target` just above the final sum.
                last.ok_or_else(|| exhausted("Weighted"))
            }
            GroupSelector::DefinedOrder { order, cursor } => {
                let len = if order.is_empty() { groups.len() } else { order.len() };
                for _ in 0..len {
                    let slot = *cursor % len;
                    *cursor = (slot + 1) % len;
                    let candidate = if order.is_empty() { slot } else { order[slot] };
                    if groups.get(candidate).map_or(false, |g| g.is_selectable()) {
                        return Ok(candidate);
                    }
                }
                Err(exhausted("DefinedOrder"))
            }
            GroupSelector::Recursive {
                inner,
                recur,
                current,
                remaining,
            } => {
                if let Some(g) = *current {
                    if *remaining > 0 && groups.get(g).map_or(false, |grp| grp.is_selectable()) {
                        *remaining -= 1;
                        return Ok(g);
                    }
                }
                let g = inner.select(groups, rng)?;
                *current = Some(g);
                *remaining = recur.saturating_sub(1);
                Ok(g)
            }
        }
    }
}
