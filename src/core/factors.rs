use std::collections::BTreeMap;
use std::sync::OnceLock;

use log::debug;
use serde::Serialize;

use super::types::{CrystallisationStrategy, DrawdownOrder, MortgageOption, SimulationParams};
use crate::config::Config;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorId {
    Crystallisation,
    Drawdown,
    Mortgage,
    MaximizeCoupleIsa,
    IsaToSipp,
    Guardrails,
    StatePensionDeferral,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorSetting {
    Crystallisation(CrystallisationStrategy),
    Drawdown(DrawdownOrder),
    Mortgage(MortgageOption),
    Toggle(bool),
    Years(u32),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorValue {
    pub id: &'static str,
    pub name: String,
    pub short_name: String,
    pub setting: FactorSetting,
}

impl FactorValue {
    fn new(id: &'static str, name: &str, short_name: &str, setting: FactorSetting) -> Self {
        Self {
            id,
            name: name.to_string(),
            short_name: short_name.to_string(),
            setting,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Factor {
    pub id: FactorId,
    pub name: &'static str,
    pub description: &'static str,
    pub values: Vec<FactorValue>,
    pub default_value_id: &'static str,
    pub depends_on: Option<FactorId>,
}

impl Factor {
    pub fn default_value(&self) -> Option<&FactorValue> {
        self.values.iter().find(|v| v.id == self.default_value_id)
    }

    fn retain_values(&self, allowed: &[&str]) -> Self {
        Self {
            values: self
                .values
                .iter()
                .filter(|v| allowed.contains(&v.id))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Quick,
    Standard,
    Thorough,
    Comprehensive,
}

impl AnalysisDepth {
    pub const ALL: [AnalysisDepth; 4] = [
        AnalysisDepth::Quick,
        AnalysisDepth::Standard,
        AnalysisDepth::Thorough,
        AnalysisDepth::Comprehensive,
    ];

    /// The slice of a factor's values this depth explores, or `None` when the
    /// factor is left out entirely.
    fn narrow(self, factor: &Factor) -> Option<Factor> {
        use AnalysisDepth::*;
        use FactorId::*;

        let narrowed = match (self, factor.id) {
            (Comprehensive, _) => factor.clone(),

            (Quick, Crystallisation) => factor.retain_values(&["gradual"]),
            (Quick, Drawdown) => factor.retain_values(&[
                "savings_first",
                "pension_first",
                "tax_optimized",
                "pension_to_isa",
            ]),
            (Quick, Mortgage) => factor.retain_values(&["normal", "early"]),
            (Quick, _) => return None,

            (Standard, Drawdown) => factor.retain_values(&[
                "savings_first",
                "pension_first",
                "tax_optimized",
                "pension_to_isa",
                "fill_basic_rate",
            ]),
            (Standard, IsaToSipp) => factor.retain_values(&["off"]),
            (Standard, MaximizeCoupleIsa) => return None,
            (Standard, StatePensionDeferral) => factor.retain_values(&["0y"]),
            (Standard, _) => factor.clone(),

            (Thorough, Drawdown) => factor.retain_values(&[
                "savings_first",
                "pension_first",
                "tax_optimized",
                "pension_to_isa",
                "pension_only",
                "fill_basic_rate",
                "state_pension_bridge",
            ]),
            (Thorough, StatePensionDeferral) => factor.retain_values(&["0y", "2y"]),
            (Thorough, _) => factor.clone(),
        };
        Some(narrowed)
    }
}

/// Registration-ordered, read-only set of factors.
#[derive(Clone, Debug, PartialEq)]
pub struct FactorRegistry {
    factors: Vec<Factor>,
}

impl FactorRegistry {
    pub fn global() -> &'static FactorRegistry {
        static REGISTRY: OnceLock<FactorRegistry> = OnceLock::new();
        REGISTRY.get_or_init(FactorRegistry::standard)
    }

    pub fn standard() -> Self {
        use FactorSetting::{Crystallisation, Drawdown, Mortgage, Toggle, Years};

        let toggle = |id: FactorId, name, description, default_value_id, depends_on| Factor {
            id,
            name,
            description,
            values: vec![
                FactorValue::new("off", "Disabled", "Off", Toggle(false)),
                FactorValue::new("on", "Enabled", "On", Toggle(true)),
            ],
            default_value_id,
            depends_on,
        };

        let drawdown_values = [
            ("savings_first", DrawdownOrder::SavingsFirst),
            ("pension_first", DrawdownOrder::PensionFirst),
            ("tax_optimized", DrawdownOrder::TaxOptimized),
            ("pension_to_isa", DrawdownOrder::PensionToIsa),
            ("pension_to_isa_proactive", DrawdownOrder::PensionToIsaProactive),
            ("pension_only", DrawdownOrder::PensionOnly),
            ("fill_basic_rate", DrawdownOrder::FillBasicRate),
            ("state_pension_bridge", DrawdownOrder::StatePensionBridge),
        ]
        .into_iter()
        .map(|(id, order)| FactorValue::new(id, order.label(), order.short_label(), Drawdown(order)))
        .collect();

        let factors = vec![
            Factor {
                id: FactorId::Crystallisation,
                name: "Crystallisation Strategy",
                description: "How pension pots are crystallised for tax purposes",
                values: vec![
                    FactorValue::new(
                        "gradual",
                        "Gradual Crystallisation",
                        "Grad",
                        Crystallisation(CrystallisationStrategy::Gradual),
                    ),
                    FactorValue::new("ufpls", "UFPLS", "UFPLS", Crystallisation(CrystallisationStrategy::Ufpls)),
                ],
                default_value_id: "gradual",
                depends_on: None,
            },
            Factor {
                id: FactorId::Drawdown,
                name: "Drawdown Order",
                description: "Order in which to withdraw from different account types",
                values: drawdown_values,
                default_value_id: "tax_optimized",
                depends_on: None,
            },
            Factor {
                id: FactorId::Mortgage,
                name: "Mortgage Option",
                description: "How the mortgage is paid off",
                values: vec![
                    FactorValue::new("early", "Early Payoff", "Early", Mortgage(MortgageOption::Early)),
                    FactorValue::new("normal", "Normal Payoff", "Normal", Mortgage(MortgageOption::Normal)),
                    FactorValue::new("extended", "Extended +10y", "Ext+10", Mortgage(MortgageOption::Extended)),
                    FactorValue::new("pcls", "PCLS Payoff", "PCLS", Mortgage(MortgageOption::PclsPayoff)),
                ],
                default_value_id: "normal",
                depends_on: None,
            },
            toggle(
                FactorId::MaximizeCoupleIsa,
                "Maximize Couple ISA",
                "Fill both people's ISA allowances from one pension",
                "on",
                Some(FactorId::Drawdown),
            ),
            toggle(
                FactorId::IsaToSipp,
                "ISA to SIPP Transfers",
                "Move ISA money into a pension while working for tax relief",
                "off",
                None,
            ),
            toggle(
                FactorId::Guardrails,
                "Guardrails",
                "Dynamic withdrawal adjustments when the portfolio drifts",
                "off",
                None,
            ),
            Factor {
                id: FactorId::StatePensionDeferral,
                name: "State Pension Deferral",
                description: "Years to defer the state pension for its enhancement",
                values: vec![
                    FactorValue::new("0y", "No Deferral", "0y", Years(0)),
                    FactorValue::new("2y", "2 Years", "2y", Years(2)),
                    FactorValue::new("5y", "5 Years", "5y", Years(5)),
                ],
                default_value_id: "0y",
                depends_on: None,
            },
        ];

        Self { factors }
    }

    pub fn get(&self, id: FactorId) -> Option<&Factor> {
        self.factors.iter().find(|f| f.id == id)
    }

    pub fn all(&self) -> &[Factor] {
        &self.factors
    }

    /// Factors that mean something for this household, with the mortgage
    /// values trimmed to the options the mortgage allows.
    pub fn applicable_factors(&self, config: &Config) -> Vec<Factor> {
        self.factors
            .iter()
            .filter(|f| match f.id {
                FactorId::Mortgage => config.has_mortgage(),
                FactorId::IsaToSipp => config.has_work_income(),
                FactorId::MaximizeCoupleIsa => config.is_couple(),
                _ => true,
            })
            .map(|f| match f.id {
                FactorId::Mortgage => mortgage_factor_for(f, config),
                _ => f.clone(),
            })
            .collect()
    }

    pub fn factors_for_depth(&self, config: &Config, depth: AnalysisDepth) -> Vec<Factor> {
        let narrowed: Vec<Factor> = self
            .applicable_factors(config)
            .iter()
            .filter_map(|f| depth.narrow(f))
            .filter(|f| !f.values.is_empty())
            .collect();

        let present: Vec<FactorId> = narrowed.iter().map(|f| f.id).collect();
        narrowed
            .into_iter()
            .filter(|f| f.depends_on.is_none_or(|dep| present.contains(&dep)))
            .collect()
    }

    pub fn default_combo(&self) -> StrategyCombo {
        StrategyCombo {
            values: self
                .factors
                .iter()
                .filter_map(|f| f.default_value().map(|v| (f.id, v.clone())))
                .collect(),
        }
    }
}

fn mortgage_factor_for(factor: &Factor, config: &Config) -> Factor {
    if !config.mortgage.should_include_extended() {
        let kept: Vec<&str> = factor
            .values
            .iter()
            .map(|v| v.id)
            .filter(|id| *id != "extended")
            .collect();
        return factor.retain_values(&kept);
    }

    let year = config.mortgage.extended_end_year();
    let mut factor = factor.clone();
    for value in factor.values.iter_mut().filter(|v| v.id == "extended") {
        value.name = format!("Extended to {year}");
        value.short_name = format!("Ext{year}");
    }
    factor
}

/// One selection across every factor in play. Missing factors read as their
/// neutral setting.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StrategyCombo {
    pub values: BTreeMap<FactorId, FactorValue>,
}

impl StrategyCombo {
    pub fn get(&self, id: FactorId) -> Option<&FactorValue> {
        self.values.get(&id)
    }

    pub fn value_id(&self, id: FactorId) -> Option<&'static str> {
        self.get(id).map(|v| v.id)
    }

    pub fn crystallisation(&self) -> CrystallisationStrategy {
        match self.get(FactorId::Crystallisation).map(|v| v.setting) {
            Some(FactorSetting::Crystallisation(strategy)) => strategy,
            _ => CrystallisationStrategy::Gradual,
        }
    }

    pub fn drawdown(&self) -> DrawdownOrder {
        match self.get(FactorId::Drawdown).map(|v| v.setting) {
            Some(FactorSetting::Drawdown(order)) => order,
            _ => DrawdownOrder::TaxOptimized,
        }
    }

    pub fn mortgage(&self) -> MortgageOption {
        match self.get(FactorId::Mortgage).map(|v| v.setting) {
            Some(FactorSetting::Mortgage(option)) => option,
            _ => MortgageOption::Normal,
        }
    }

    pub fn toggle(&self, id: FactorId) -> bool {
        matches!(self.get(id).map(|v| v.setting), Some(FactorSetting::Toggle(true)))
    }

    pub fn years(&self, id: FactorId) -> u32 {
        match self.get(id).map(|v| v.setting) {
            Some(FactorSetting::Years(years)) => years,
            _ => 0,
        }
    }

    pub fn to_simulation_params(&self) -> SimulationParams {
        SimulationParams {
            crystallisation: self.crystallisation(),
            drawdown_order: self.drawdown(),
            mortgage: self.mortgage(),
            maximize_couple_isa: self.toggle(FactorId::MaximizeCoupleIsa),
            isa_to_sipp: self.toggle(FactorId::IsaToSipp),
            guardrails: self.toggle(FactorId::Guardrails),
            state_pension_defer_years: self.years(FactorId::StatePensionDeferral),
        }
    }

    pub fn short_name(&self) -> String {
        self.values
            .values()
            .map(|v| v.short_name.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn display_name(&self) -> String {
        self.values
            .values()
            .map(|v| v.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Constraint {
    pub name: &'static str,
    pub predicate: fn(&StrategyCombo) -> bool,
}

impl Constraint {
    pub fn allows(&self, combo: &StrategyCombo) -> bool {
        (self.predicate)(combo)
    }
}

pub fn default_constraints() -> &'static [Constraint] {
    static CONSTRAINTS: [Constraint; 3] = [
        Constraint {
            name: "couple ISA needs a pension-to-ISA drawdown",
            predicate: |combo| {
                !combo.toggle(FactorId::MaximizeCoupleIsa) || combo.drawdown().is_pension_to_isa()
            },
        },
        Constraint {
            name: "ISA-to-SIPP conflicts with pension-to-ISA drawdown",
            predicate: |combo| {
                !combo.toggle(FactorId::IsaToSipp) || !combo.drawdown().is_pension_to_isa()
            },
        },
        Constraint {
            name: "UFPLS cannot fund a PCLS mortgage payoff",
            predicate: |combo| {
                !(combo.crystallisation() == CrystallisationStrategy::Ufpls
                    && combo.mortgage() == MortgageOption::PclsPayoff)
            },
        },
    ];
    &CONSTRAINTS
}

pub fn satisfies_all(combo: &StrategyCombo, constraints: &[Constraint]) -> bool {
    constraints.iter().all(|c| c.allows(combo))
}

/// Cartesian product of the factors' values, minus anything a constraint
/// rejects. Output order follows factor and value order.
pub fn generate_combinations(factors: &[Factor], constraints: &[Constraint]) -> Vec<StrategyCombo> {
    let mut combos = vec![StrategyCombo::default()];
    for factor in factors {
        combos = combos
            .iter()
            .flat_map(|combo| {
                factor.values.iter().map(move |value| {
                    let mut next = combo.clone();
                    next.values.insert(factor.id, value.clone());
                    next
                })
            })
            .collect();
    }
    combos.retain(|combo| satisfies_all(combo, constraints));
    combos
}

pub fn combinations_for_config(config: &Config, depth: AnalysisDepth) -> Vec<StrategyCombo> {
    let registry = FactorRegistry::global();
    let factors = registry.factors_for_depth(config, depth);
    let combos = generate_combinations(&factors, default_constraints());
    debug!(
        "{depth:?}: {} factors, {} combinations",
        factors.len(),
        combos.len()
    );
    combos
}

pub fn get_strategies_for_config_v2(config: &Config, depth: AnalysisDepth) -> Vec<SimulationParams> {
    combinations_for_config(config, depth)
        .iter()
        .map(StrategyCombo::to_simulation_params)
        .collect()
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinationCounts {
    pub quick: usize,
    pub standard: usize,
    pub thorough: usize,
    pub comprehensive: usize,
}

pub fn combination_count(config: &Config) -> CombinationCounts {
    let count = |depth| combinations_for_config(config, depth).len();
    CombinationCounts {
        quick: count(AnalysisDepth::Quick),
        standard: count(AnalysisDepth::Standard),
        thorough: count(AnalysisDepth::Thorough),
        comprehensive: count(AnalysisDepth::Comprehensive),
    }
}

const LEGACY_GRADUAL_ORDERS: [DrawdownOrder; 6] = [
    DrawdownOrder::SavingsFirst,
    DrawdownOrder::PensionFirst,
    DrawdownOrder::TaxOptimized,
    DrawdownOrder::PensionToIsa,
    DrawdownOrder::FillBasicRate,
    DrawdownOrder::StatePensionBridge,
];

const LEGACY_UFPLS_ORDERS: [DrawdownOrder; 5] = [
    DrawdownOrder::SavingsFirst,
    DrawdownOrder::PensionFirst,
    DrawdownOrder::TaxOptimized,
    DrawdownOrder::FillBasicRate,
    DrawdownOrder::StatePensionBridge,
];

const ALL_MORTGAGE_OPTIONS: [MortgageOption; 4] = [
    MortgageOption::Early,
    MortgageOption::Normal,
    MortgageOption::Extended,
    MortgageOption::PclsPayoff,
];

fn mortgage_options_for(config: &Config) -> &'static [MortgageOption] {
    if config.has_mortgage() {
        &ALL_MORTGAGE_OPTIONS
    } else {
        &[MortgageOption::Normal]
    }
}

/// The fixed strategy list: every gradual policy under each relevant
/// mortgage option, then the UFPLS policies under normal payoff.
pub fn get_strategies_for_config(config: &Config) -> Vec<SimulationParams> {
    let mut strategies: Vec<SimulationParams> = mortgage_options_for(config)
        .iter()
        .flat_map(|&mortgage| {
            LEGACY_GRADUAL_ORDERS.iter().map(move |&order| {
                SimulationParams::new(CrystallisationStrategy::Gradual, order, mortgage)
            })
        })
        .collect();
    strategies.extend(LEGACY_UFPLS_ORDERS.iter().map(|&order| {
        SimulationParams::new(CrystallisationStrategy::Ufpls, order, MortgageOption::Normal)
    }));
    strategies
}

pub fn pension_only_strategies(config: &Config) -> Vec<SimulationParams> {
    single_order_strategies(config, DrawdownOrder::PensionOnly)
}

pub fn pension_to_isa_strategies(config: &Config) -> Vec<SimulationParams> {
    single_order_strategies(config, DrawdownOrder::PensionToIsa)
}

fn single_order_strategies(config: &Config, order: DrawdownOrder) -> Vec<SimulationParams> {
    mortgage_options_for(config)
        .iter()
        .map(|&mortgage| SimulationParams::new(CrystallisationStrategy::Gradual, order, mortgage))
        .collect()
}
