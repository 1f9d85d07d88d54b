use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    AllowanceTaper, GrowthPath, MortgageOption, Person, TaxBand, TaxTable, uk_default_bands,
};

const DEFAULT_EXTENSION_YEARS: i32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[from]
        source: serde_json::Error,
    },
    #[error("invalid config: {details}")]
    Invalid { details: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersonConfig {
    pub name: String,
    pub birth_year: i32,
    pub pension_access_age: u32,
    pub state_pension_age: u32,
    pub state_pension_amount: f64,
    pub state_pension_defer_years: u32,
    pub tax_free_savings: f64,
    #[serde(alias = "pension")]
    pub uncrystallised_pot: f64,
    pub crystallised_pot: f64,
    pub pcls_taken: bool,
    pub isa_annual_limit: f64,
    pub isa_minimum: f64,
    pub work_income: f64,
}

impl Default for PersonConfig {
    fn default() -> Self {
        Self {
            name: "Person".to_string(),
            birth_year: 1970,
            pension_access_age: 57,
            state_pension_age: 67,
            state_pension_amount: 11_502.0,
            state_pension_defer_years: 0,
            tax_free_savings: 0.0,
            uncrystallised_pot: 0.0,
            crystallised_pot: 0.0,
            pcls_taken: false,
            isa_annual_limit: 20_000.0,
            isa_minimum: 0.0,
            work_income: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MortgagePartConfig {
    pub name: String,
    pub principal: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MortgageConfig {
    pub parts: Vec<MortgagePartConfig>,
    pub end_year: i32,
    pub early_payoff_year: i32,
    pub allow_extension: bool,
    pub extended_end_year: i32,
}

impl MortgageConfig {
    pub fn has_mortgage(&self) -> bool {
        self.parts.iter().any(|part| part.principal > 0.0)
    }

    pub fn should_include_extended(&self) -> bool {
        self.has_mortgage() && self.allow_extension
    }

    pub fn extended_end_year(&self) -> i32 {
        if self.extended_end_year > 0 {
            self.extended_end_year
        } else {
            self.end_year + DEFAULT_EXTENSION_YEARS
        }
    }

    /// Year the balance is cleared under `option`, or 0 with no mortgage.
    pub fn payoff_year(&self, option: MortgageOption) -> i32 {
        if !self.has_mortgage() {
            return 0;
        }
        match option {
            MortgageOption::Early if self.early_payoff_year > 0 => self.early_payoff_year,
            MortgageOption::Extended => self.extended_end_year(),
            MortgageOption::Early | MortgageOption::Normal | MortgageOption::PclsPayoff => {
                self.end_year
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationConfig {
    pub start_year: i32,
    pub end_age: u32,
    pub state_pension_inflation: f64,
    pub state_pension_deferral_rate: f64,
    pub growth: GrowthPath,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_year: 2026,
            end_age: 95,
            state_pension_inflation: 0.0,
            state_pension_deferral_rate: 0.058,
            growth: GrowthPath::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaxConfig {
    pub bands: Vec<TaxBand>,
    pub taper: Option<AllowanceTaper>,
    pub band_inflation: f64,
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            bands: uk_default_bands(),
            taper: Some(AllowanceTaper::default()),
            band_inflation: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub people: Vec<PersonConfig>,
    pub mortgage: MortgageConfig,
    pub simulation: SimulationConfig,
    pub tax: TaxConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.people.is_empty() {
            problems.push("people must list at least one person".to_string());
        }
        for (i, person) in self.people.iter().enumerate() {
            let field = |name: &str| format!("people[{i}].{name}");
            if person.name.trim().is_empty() {
                problems.push(format!("{} must not be empty", field("name")));
            }
            for (name, value) in [
                ("taxFreeSavings", person.tax_free_savings),
                ("uncrystallisedPot", person.uncrystallised_pot),
                ("crystallisedPot", person.crystallised_pot),
                ("isaAnnualLimit", person.isa_annual_limit),
                ("isaMinimum", person.isa_minimum),
                ("statePensionAmount", person.state_pension_amount),
                ("workIncome", person.work_income),
            ] {
                if !value.is_finite() || value < 0.0 {
                    problems.push(format!("{} must be >= 0", field(name)));
                }
            }
        }

        for (i, part) in self.mortgage.parts.iter().enumerate() {
            if !part.principal.is_finite() || part.principal < 0.0 {
                problems.push(format!("mortgage.parts[{i}].principal must be >= 0"));
            }
        }
        if self.mortgage.has_mortgage() && self.mortgage.end_year <= 0 {
            problems.push("mortgage.endYear is required when a part has principal > 0".to_string());
        }
        if self.mortgage.allow_extension
            && self.mortgage.extended_end_year > 0
            && self.mortgage.extended_end_year < self.mortgage.end_year
        {
            problems.push("mortgage.extendedEndYear must be >= mortgage.endYear".to_string());
        }

        if self.tax.bands.is_empty() {
            problems.push("tax.bands must not be empty".to_string());
        }
        for (i, band) in self.tax.bands.iter().enumerate() {
            if band.upper <= band.lower {
                problems.push(format!("tax.bands[{i}].upper must be > lower"));
            }
            if !(0.0..=1.0).contains(&band.rate) {
                problems.push(format!("tax.bands[{i}].rate must be between 0 and 1"));
            }
        }
        for (i, pair) in self.tax.bands.windows(2).enumerate() {
            if (pair[1].lower - pair[0].upper).abs() > f64::EPSILON {
                problems.push(format!(
                    "tax.bands[{}].lower must equal tax.bands[{i}].upper",
                    i + 1
                ));
            }
        }
        if self.tax.band_inflation <= -1.0 {
            problems.push("tax.bandInflation must be > -1".to_string());
        }
        if self.simulation.state_pension_deferral_rate < 0.0 {
            problems.push("simulation.statePensionDeferralRate must be >= 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                details: problems.join("; "),
            })
        }
    }

    pub fn has_mortgage(&self) -> bool {
        self.mortgage.has_mortgage()
    }

    pub fn is_couple(&self) -> bool {
        self.people.len() >= 2
    }

    pub fn has_work_income(&self) -> bool {
        self.people.iter().any(|p| p.work_income > 0.0)
    }

    pub fn build_people(&self) -> Vec<Person> {
        self.people
            .iter()
            .map(|pc| Person {
                name: pc.name.clone(),
                birth_year: pc.birth_year,
                pension_access_age: pc.pension_access_age,
                state_pension_age: pc.state_pension_age,
                state_pension_defer_years: pc.state_pension_defer_years,
                state_pension_deferral_rate: self.simulation.state_pension_deferral_rate,
                tax_free_savings: pc.tax_free_savings,
                uncrystallised_pot: pc.uncrystallised_pot,
                crystallised_pot: pc.crystallised_pot,
                pcls_taken: pc.pcls_taken,
                isa_annual_limit: pc.isa_annual_limit,
                isa_minimum: pc.isa_minimum,
            })
            .collect()
    }

    pub fn tax_table_for_year(&self, year: i32) -> TaxTable {
        TaxTable::new(self.tax.bands.clone(), self.tax.taper).inflated(
            self.simulation.start_year,
            year,
            self.tax.band_inflation,
        )
    }

    /// Each person's state pension for `year`, index-aligned with
    /// [`Config::build_people`]. Zero until the (deferred) start age.
    pub fn state_pension_for_year(&self, year: i32) -> Vec<f64> {
        let elapsed = (year - self.simulation.start_year).max(0);
        let uplift = (1.0 + self.simulation.state_pension_inflation).powi(elapsed);
        self.build_people()
            .iter()
            .zip(&self.people)
            .map(|(person, pc)| {
                if person.receives_state_pension(year) {
                    person.deferred_state_pension(pc.state_pension_amount * uplift)
                } else {
                    0.0
                }
            })
            .collect()
    }
}
