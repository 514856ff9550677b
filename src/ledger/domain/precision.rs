use rust_decimal::Decimal;

/// The largest number of significant digits a [`Decimal`] mantissa can hold.
const MAX_SUPPORTED_DIGITS: u32 = 28;

/// The fixed-point shape of persisted amounts and balances.
///
/// This mirrors a SQL `NUMERIC(max_digits, decimal_places)` column: values may
/// have at most `decimal_places` fractional digits and at most `max_digits`
/// digits in total.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Precision {
    max_digits: u32,
    decimal_places: u32,
}

impl Precision {
    /// Construct a new precision.
    ///
    /// # Arguments
    /// * `max_digits` - The total number of digits allowed. Values above 28
    ///   are clamped to what a [`Decimal`] can represent.
    /// * `decimal_places` - The number of fractional digits allowed. This is
    ///   clamped to `max_digits`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use cashbook_ledger::ledger::domain::precision::Precision;
    /// let numeric_12_2 = Precision::new(12, 2);
    /// assert_eq!(2, numeric_12_2.decimal_places());
    /// ```
    pub fn new(max_digits: u32, decimal_places: u32) -> Self {
        let max_digits = max_digits.clamp(1, MAX_SUPPORTED_DIGITS);

        Self {
            max_digits,
            decimal_places: decimal_places.min(max_digits),
        }
    }

    pub fn max_digits(&self) -> u32 {
        self.max_digits
    }

    pub fn decimal_places(&self) -> u32 {
        self.decimal_places
    }

    /// The largest absolute value that can be stored, eg `9999999999.99` for
    /// `NUMERIC(12, 2)`.
    pub fn max_magnitude(&self) -> Decimal {
        let mantissa = 10i128.pow(self.max_digits) - 1;

        Decimal::from_i128_with_scale(mantissa, self.decimal_places)
    }

    /// Determine if a value can be stored without rounding or overflowing.
    pub fn fits(&self, value: Decimal) -> bool {
        value.abs() <= self.max_magnitude() && fractional_digits(value) <= self.decimal_places
    }

    /// Format a value with exactly the configured number of decimal places.
    pub fn format_value(&self, value: Decimal) -> String {
        format!("{:.*}", self.decimal_places as usize, value)
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::new(12, 2)
    }
}

/// The number of significant fractional digits in a value, ignoring trailing
/// zeroes.
pub fn fractional_digits(value: Decimal) -> u32 {
    value.normalize().scale()
}
