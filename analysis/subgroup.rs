//! Stratified meta-analysis by a moderator cut-off.
//!
//! Studies with a moderator value below the threshold form the `below` group and
//! the rest the `at_or_above` group. Each group gets its own pooled REML fit. The
//! test of subgroup differences is the QM statistic of a mixed-effects model with a
//! single 0/1 indicator for the `at_or_above` group.

use crate::data::OutcomeData;
use crate::estimate::{EstimationError, RemlOptions, fit_random_effects, fit_random_effects_named};
use crate::model::{OmnibusTest, RandomEffectsFit};
use ndarray::{Array1, Array2, Axis};

/// Pooled fit of the studies on one side of the threshold.
#[derive(Debug, Clone)]
pub struct SubgroupFit {
    pub ids: Vec<String>,
    pub fit: RandomEffectsFit,
}

#[derive(Debug, Clone)]
pub struct SubgroupAnalysis {
    pub threshold: f64,
    pub below: SubgroupFit,
    pub at_or_above: SubgroupFit,
    /// QM with df 1 from the indicator meta-regression.
    pub difference: OmnibusTest,
}

pub fn analyze_subgroups(
    data: &OutcomeData,
    threshold: f64,
    options: &RemlOptions,
) -> Result<SubgroupAnalysis, EstimationError> {
    if !threshold.is_finite() {
        return Err(EstimationError::InvalidInput(format!(
            "subgroup threshold must be finite, got {threshold}"
        )));
    }

    let indicator: Array1<f64> = data
        .moderator
        .mapv(|m| if m >= threshold { 1.0 } else { 0.0 });
    let (below_idx, above_idx): (Vec<usize>, Vec<usize>) =
        (0..data.len()).partition(|&i| indicator[i] == 0.0);

    for (label, idx) in [("below", &below_idx), ("at or above", &above_idx)] {
        if idx.len() < 2 {
            return Err(EstimationError::InsufficientData(format!(
                "{} studies of {} fall {label} the threshold {threshold}; at least 2 are required",
                idx.len(),
                data.outcome
            )));
        }
    }

    let below = pooled_subset(data, &below_idx, options)?;
    let at_or_above = pooled_subset(data, &above_idx, options)?;

    let moderators: Array2<f64> = indicator.insert_axis(Axis(1));
    let names = ["intrcpt".to_string(), format!("ferritin>={threshold}")];
    let mixed = fit_random_effects_named(
        data.yi.view(),
        data.sei.view(),
        Some(moderators.view()),
        &names,
        options,
    )?;
    let difference = mixed.omnibus.ok_or_else(|| {
        EstimationError::InvalidInput("indicator model produced no omnibus test".to_string())
    })?;

    log::info!(
        "Subgroups of {} at {threshold}: below {:.3} (k = {}), at or above {:.3} (k = {}), QM(1) = {:.3}, p = {:.3e}",
        data.outcome,
        below.fit.pooled().estimate,
        below.ids.len(),
        at_or_above.fit.pooled().estimate,
        at_or_above.ids.len(),
        difference.qm,
        difference.p_value
    );

    Ok(SubgroupAnalysis {
        threshold,
        below,
        at_or_above,
        difference,
    })
}

fn pooled_subset(
    data: &OutcomeData,
    indices: &[usize],
    options: &RemlOptions,
) -> Result<SubgroupFit, EstimationError> {
    let yi = data.yi.select(Axis(0), indices);
    let sei = data.sei.select(Axis(0), indices);
    let fit = fit_random_effects(yi.view(), sei.view(), None, options)?;
    Ok(SubgroupFit {
        ids: indices.iter().map(|&i| data.ids[i].clone()).collect(),
        fit,
    })
}
