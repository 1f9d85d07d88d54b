use serde::{Deserialize, Serialize};

const DEFAULT_PERSONAL_ALLOWANCE: f64 = 12_570.0;
const DEFAULT_BASIC_RATE_LIMIT: f64 = 50_270.0;
const DEFAULT_BASIC_RATE: f64 = 0.20;
const BASIC_RATE_CEILING: f64 = 0.25;
const GROSS_UP_ITERATIONS: u32 = 100;
const GROSS_UP_TOLERANCE: f64 = 0.01;
const GROSS_UP_HIGH_MULTIPLIER: f64 = 2.5;
const ABOVE_ALL_BANDS_STEP: f64 = 100_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBand {
    #[serde(default)]
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub rate: f64,
}

impl TaxBand {
    pub fn new(name: &str, lower: f64, upper: f64, rate: f64) -> Self {
        Self {
            name: name.to_string(),
            lower,
            upper,
            rate,
        }
    }
}

/// Personal allowance withdrawal above an income threshold: the zero-rate
/// band shrinks by `rate` for every pound of income over `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceTaper {
    pub threshold: f64,
    pub rate: f64,
}

impl Default for AllowanceTaper {
    fn default() -> Self {
        Self {
            threshold: 100_000.0,
            rate: 0.5,
        }
    }
}

/// Progressive band schedule for one tax year. Bands are ascending and
/// contiguous; the top band is effectively unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxTable {
    bands: Vec<TaxBand>,
    taper: Option<AllowanceTaper>,
}

impl TaxTable {
    pub fn new(bands: Vec<TaxBand>, taper: Option<AllowanceTaper>) -> Self {
        Self { bands, taper }
    }

    pub fn uk_default() -> Self {
        Self::new(uk_default_bands(), Some(AllowanceTaper::default()))
    }

    pub fn flat(rate: f64) -> Self {
        Self::new(vec![TaxBand::new("Flat", 0.0, f64::MAX, rate)], None)
    }

    pub fn bands(&self) -> &[TaxBand] {
        &self.bands
    }

    pub fn taper(&self) -> Option<AllowanceTaper> {
        self.taper
    }

    /// Scales every threshold by `(1 + rate)^(year - start_year)`. Rates are
    /// left alone.
    pub fn inflated(&self, start_year: i32, year: i32, rate: f64) -> Self {
        if rate == 0.0 || year <= start_year {
            return self.clone();
        }
        let multiplier = (1.0 + rate).powi(year - start_year);
        let bands = self
            .bands
            .iter()
            .map(|band| TaxBand {
                name: band.name.clone(),
                lower: band.lower * multiplier,
                upper: scale_bound(band.upper, multiplier),
                rate: band.rate,
            })
            .collect();
        let taper = self.taper.map(|taper| AllowanceTaper {
            threshold: taper.threshold * multiplier,
            rate: taper.rate,
        });
        Self { bands, taper }
    }

    pub fn total_tax(&self, income: f64) -> f64 {
        if income <= 0.0 {
            return 0.0;
        }
        tax_on_bands(income, &self.bands, self.tapered_allowance(income))
    }

    pub fn marginal_tax(&self, amount: f64, existing_income: f64) -> f64 {
        self.total_tax(existing_income + amount) - self.total_tax(existing_income)
    }

    /// Gross amount that nets `net_target` once taxed on top of
    /// `existing_income`, with no tax-free portion.
    pub fn gross_up(&self, net_target: f64, existing_income: f64) -> (f64, f64) {
        if net_target <= 0.0 {
            return (0.0, 0.0);
        }

        let mut lo = net_target;
        let mut hi = net_target * GROSS_UP_HIGH_MULTIPLIER;
        for _ in 0..GROSS_UP_ITERATIONS {
            let mid = (lo + hi) * 0.5;
            let tax = self.marginal_tax(mid, existing_income);
            let net = mid - tax;
            if (net - net_target).abs() < GROSS_UP_TOLERANCE {
                return (mid, tax);
            }
            if net < net_target {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        (hi, self.marginal_tax(hi, existing_income))
    }

    pub fn marginal_rate(&self, income: f64) -> f64 {
        self.bands
            .iter()
            .find(|band| income >= band.lower && income < band.upper)
            .or_else(|| self.bands.last())
            .map(|band| band.rate)
            .unwrap_or(0.0)
    }

    pub fn next_band_threshold(&self, income: f64) -> f64 {
        self.bands
            .iter()
            .find(|band| income >= band.lower && income < band.upper)
            .map(|band| band.upper)
            .unwrap_or(income + ABOVE_ALL_BANDS_STEP)
    }

    pub fn personal_allowance(&self) -> f64 {
        match self.bands.first() {
            Some(band) if band.rate == 0.0 => band.upper,
            _ => DEFAULT_PERSONAL_ALLOWANCE,
        }
    }

    /// The lowest non-zero band, falling back to the UK basic rate band.
    pub fn basic_rate_band(&self) -> TaxBand {
        self.bands
            .iter()
            .find(|band| band.rate > 0.0 && band.rate <= BASIC_RATE_CEILING)
            .cloned()
            .unwrap_or_else(|| {
                TaxBand::new(
                    "Basic Rate",
                    DEFAULT_PERSONAL_ALLOWANCE,
                    DEFAULT_BASIC_RATE_LIMIT,
                    DEFAULT_BASIC_RATE,
                )
            })
    }

    pub fn basic_rate_limit(&self) -> f64 {
        self.basic_rate_band().upper
    }

    fn tapered_allowance(&self, income: f64) -> Option<f64> {
        let taper = self.taper?;
        if income <= taper.threshold {
            return None;
        }
        let allowance_band = self
            .bands
            .iter()
            .find(|band| band.lower == 0.0 && band.rate == 0.0)?;
        let reduction = (income - taper.threshold) * taper.rate;
        Some((allowance_band.upper - reduction).max(0.0))
    }
}

impl Default for TaxTable {
    fn default() -> Self {
        Self::uk_default()
    }
}

pub fn uk_default_bands() -> Vec<TaxBand> {
    vec![
        TaxBand::new("Personal Allowance", 0.0, 12_570.0, 0.0),
        TaxBand::new("Basic Rate", 12_570.0, 50_270.0, 0.20),
        TaxBand::new("Higher Rate", 50_270.0, 125_140.0, 0.40),
        TaxBand::new("Additional Rate", 125_140.0, 1_000_000_000.0, 0.45),
    ]
}

fn scale_bound(bound: f64, multiplier: f64) -> f64 {
    if bound >= f64::MAX / multiplier.max(1.0) {
        bound
    } else {
        bound * multiplier
    }
}

fn tax_on_bands(income: f64, bands: &[TaxBand], tapered_allowance: Option<f64>) -> f64 {
    let mut total = 0.0;
    let mut previous_zero_band = false;
    for band in bands {
        let mut lower = band.lower;
        let mut upper = band.upper;
        if let Some(allowance) = tapered_allowance {
            if band.lower == 0.0 && band.rate == 0.0 {
                upper = allowance;
            } else if band.rate > 0.0 && previous_zero_band {
                lower = allowance;
            }
        }
        previous_zero_band = band.rate == 0.0;

        if income <= lower {
            break;
        }
        let in_band = income.min(upper) - lower;
        if in_band > 0.0 {
            total += in_band * band.rate;
        }
    }
    total
}
