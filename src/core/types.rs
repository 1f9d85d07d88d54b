use serde::{Deserialize, Serialize};

pub const PENSION_TAX_FREE_FRACTION: f64 = 0.25;
const MIN_PLAUSIBLE_BIRTH_YEAR: i32 = 1900;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrystallisationStrategy {
    #[default]
    Gradual,
    Ufpls,
}

impl CrystallisationStrategy {
    /// Share of each pound taken from the uncrystallised pot that arrives
    /// tax-free for a person in the given lump-sum state.
    pub fn tax_free_fraction(self, pcls_taken: bool) -> f64 {
        match self {
            CrystallisationStrategy::Gradual if pcls_taken => 0.0,
            CrystallisationStrategy::Gradual | CrystallisationStrategy::Ufpls => {
                PENSION_TAX_FREE_FRACTION
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CrystallisationStrategy::Gradual => "Gradual Crystallisation",
            CrystallisationStrategy::Ufpls => "UFPLS (Flexible Lump Sums)",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownOrder {
    SavingsFirst,
    PensionFirst,
    #[default]
    TaxOptimized,
    PensionOnly,
    PensionToIsa,
    PensionToIsaProactive,
    FillBasicRate,
    StatePensionBridge,
}

impl DrawdownOrder {
    pub const ALL: [DrawdownOrder; 8] = [
        DrawdownOrder::SavingsFirst,
        DrawdownOrder::PensionFirst,
        DrawdownOrder::TaxOptimized,
        DrawdownOrder::PensionOnly,
        DrawdownOrder::PensionToIsa,
        DrawdownOrder::PensionToIsaProactive,
        DrawdownOrder::FillBasicRate,
        DrawdownOrder::StatePensionBridge,
    ];

    pub fn label(self) -> &'static str {
        match self {
            DrawdownOrder::SavingsFirst => "Savings First",
            DrawdownOrder::PensionFirst => "Pension First",
            DrawdownOrder::TaxOptimized => "Tax Optimized",
            DrawdownOrder::PensionOnly => "Pension Only",
            DrawdownOrder::PensionToIsa => "Pension to ISA",
            DrawdownOrder::PensionToIsaProactive => "Pension to ISA (Proactive)",
            DrawdownOrder::FillBasicRate => "Fill Basic Rate",
            DrawdownOrder::StatePensionBridge => "State Pension Bridge",
        }
    }

    pub fn short_label(self) -> &'static str {
        match self {
            DrawdownOrder::SavingsFirst => "ISAFirst",
            DrawdownOrder::PensionFirst => "PenFirst",
            DrawdownOrder::TaxOptimized => "TaxOpt",
            DrawdownOrder::PensionOnly => "PenOnly",
            DrawdownOrder::PensionToIsa => "Pen2ISA",
            DrawdownOrder::PensionToIsaProactive => "Pen2ISA+",
            DrawdownOrder::FillBasicRate => "FillBasic",
            DrawdownOrder::StatePensionBridge => "SPBridge",
        }
    }

    pub fn is_pension_to_isa(self) -> bool {
        matches!(
            self,
            DrawdownOrder::PensionToIsa | DrawdownOrder::PensionToIsaProactive
        )
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MortgageOption {
    Early,
    #[default]
    Normal,
    Extended,
    PclsPayoff,
}

impl MortgageOption {
    pub fn short_label(self) -> &'static str {
        match self {
            MortgageOption::Early => "Early",
            MortgageOption::Normal => "Normal",
            MortgageOption::Extended => "Ext+10",
            MortgageOption::PclsPayoff => "PCLS",
        }
    }
}

/// One fully specified execution tuple for a simulation run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParams {
    pub crystallisation: CrystallisationStrategy,
    pub drawdown_order: DrawdownOrder,
    pub mortgage: MortgageOption,
    pub maximize_couple_isa: bool,
    pub isa_to_sipp: bool,
    pub guardrails: bool,
    pub state_pension_defer_years: u32,
}

impl SimulationParams {
    pub fn new(
        crystallisation: CrystallisationStrategy,
        drawdown_order: DrawdownOrder,
        mortgage: MortgageOption,
    ) -> Self {
        Self {
            crystallisation,
            drawdown_order,
            mortgage,
            ..Self::default()
        }
    }

    pub fn short_name(&self) -> String {
        format!(
            "{}/{}",
            self.drawdown_order.short_label(),
            self.mortgage.short_label()
        )
    }

    pub fn description(&self, mortgage_payoff_year: i32) -> String {
        let drawdown = self.drawdown_order.label();
        if mortgage_payoff_year <= 0 {
            return drawdown.to_string();
        }
        let mortgage = match self.mortgage {
            MortgageOption::Early | MortgageOption::Normal => {
                format!("Mortgage repaid {mortgage_payoff_year}")
            }
            MortgageOption::Extended => format!("Mortgage extended to {mortgage_payoff_year}"),
            MortgageOption::PclsPayoff => {
                format!("PCLS lump sum for mortgage {mortgage_payoff_year}")
            }
        };
        format!("{drawdown}, {mortgage}")
    }
}

/// Per-person account ledger, mutated in place by the drawdown policies.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub name: String,
    pub birth_year: i32,
    pub pension_access_age: u32,
    pub state_pension_age: u32,
    pub state_pension_defer_years: u32,
    pub state_pension_deferral_rate: f64,
    pub tax_free_savings: f64,
    pub uncrystallised_pot: f64,
    pub crystallised_pot: f64,
    pub pcls_taken: bool,
    pub isa_annual_limit: f64,
    pub isa_minimum: f64,
}

impl Person {
    pub fn new(name: &str, birth_year: i32, pension_access_age: u32) -> Self {
        Self {
            name: name.to_string(),
            birth_year,
            pension_access_age,
            state_pension_age: 67,
            state_pension_defer_years: 0,
            state_pension_deferral_rate: 0.0,
            tax_free_savings: 0.0,
            uncrystallised_pot: 0.0,
            crystallised_pot: 0.0,
            pcls_taken: false,
            isa_annual_limit: 20_000.0,
            isa_minimum: 0.0,
        }
    }

    /// Tax-free savings above the preserved minimum.
    pub fn available_isa(&self) -> f64 {
        (self.tax_free_savings - self.isa_minimum).max(0.0)
    }

    pub fn total_pension(&self) -> f64 {
        self.crystallised_pot + self.uncrystallised_pot
    }

    pub fn total_wealth(&self) -> f64 {
        self.tax_free_savings + self.total_pension()
    }

    pub fn age_in(&self, year: i32) -> Option<u32> {
        if self.birth_year < MIN_PLAUSIBLE_BIRTH_YEAR || self.birth_year > year {
            return None;
        }
        u32::try_from(year - self.birth_year).ok()
    }

    pub fn can_access_pension(&self, year: i32) -> bool {
        self.age_in(year)
            .is_some_and(|age| age >= self.pension_access_age)
    }

    pub fn effective_state_pension_age(&self) -> u32 {
        self.state_pension_age + self.state_pension_defer_years
    }

    pub fn receives_state_pension(&self, year: i32) -> bool {
        self.age_in(year)
            .is_some_and(|age| age >= self.effective_state_pension_age())
    }

    /// Base state pension compounded by the deferral enhancement.
    pub fn deferred_state_pension(&self, base_amount: f64) -> f64 {
        if self.state_pension_defer_years == 0 || self.state_pension_deferral_rate <= 0.0 {
            return base_amount;
        }
        base_amount * (1.0 + self.state_pension_deferral_rate).powi(self.state_pension_defer_years as i32)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonWithdrawal {
    pub name: String,
    pub tax_free_from_isa: f64,
    pub tax_free_from_pension: f64,
    pub taxable_from_pension: f64,
    pub isa_deposit: f64,
}

impl PersonWithdrawal {
    pub fn gross_withdrawn(&self) -> f64 {
        self.tax_free_from_isa + self.tax_free_from_pension + self.taxable_from_pension
    }
}

/// Where one year's money came from and where any surplus went. Entries are
/// index-aligned with the people slice the policy ran over.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalBreakdown {
    pub people: Vec<PersonWithdrawal>,
}

impl WithdrawalBreakdown {
    pub fn for_people(people: &[Person]) -> Self {
        Self {
            people: people
                .iter()
                .map(|p| PersonWithdrawal {
                    name: p.name.clone(),
                    ..PersonWithdrawal::default()
                })
                .collect(),
        }
    }

    pub fn total_tax_free(&self) -> f64 {
        self.people
            .iter()
            .map(|p| p.tax_free_from_isa + p.tax_free_from_pension)
            .sum()
    }

    pub fn total_taxable(&self) -> f64 {
        self.people.iter().map(|p| p.taxable_from_pension).sum()
    }

    pub fn total_isa_deposits(&self) -> f64 {
        self.people.iter().map(|p| p.isa_deposit).sum()
    }

    pub fn total_from_isa(&self) -> f64 {
        self.people.iter().map(|p| p.tax_free_from_isa).sum()
    }

    pub fn total_from_pension(&self) -> f64 {
        self.people
            .iter()
            .map(|p| p.tax_free_from_pension + p.taxable_from_pension)
            .sum()
    }

    pub fn taxable_for(&self, index: usize) -> f64 {
        self.people
            .get(index)
            .map(|p| p.taxable_from_pension)
            .unwrap_or(0.0)
    }
}
