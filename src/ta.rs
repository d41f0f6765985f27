//! Technical indicator math over daily closes.
//!
//! Pure functions, no I/O. Insufficient data is an explicit error carrying
//! the observed point count so agents can report it verbatim.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::HistoryRow;

pub fn extract_closes(rows: &[HistoryRow]) -> Vec<f64> {
    rows.iter().map(|r| r.close).collect()
}

/// Simple moving average of the last `period` closes.
pub fn sma(closes: &[f64], period: usize) -> Result<f64> {
    if closes.len() < period || period == 0 {
        bail!("Not enough data for SMA-{period}. Got {} points.", closes.len());
    }
    Ok(closes[closes.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values, then folded forward with multiplier 2/(period+1).
pub fn ema(closes: &[f64], period: usize) -> Result<f64> {
    if closes.len() < period || period == 0 {
        bail!("Not enough data for EMA-{period}. Got {} points.", closes.len());
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut value = closes[..period].iter().sum::<f64>() / period as f64;
    for price in &closes[period..] {
        value = (price - value) * multiplier + value;
    }
    Ok(value)
}

/// RSI with Wilder's smoothing. A series with zero average loss pegs at 100.
pub fn rsi(closes: &[f64], period: usize) -> Result<f64> {
    if closes.len() <= period || period == 0 {
        bail!("Not enough data for RSI-{period}. Got {} points.", closes.len());
    }
    let mut gains = Vec::with_capacity(closes.len() - 1);
    let mut losses = Vec::with_capacity(closes.len() - 1);
    for pair in closes.windows(2) {
        let delta = pair[1] - pair[0];
        gains.push(delta.max(0.0));
        losses.push((-delta).max(0.0));
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;
    for i in period..gains.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
    }

    if avg_loss == 0.0 {
        return Ok(100.0);
    }
    let rs = avg_gain / avg_loss;
    Ok(100.0 - (100.0 / (1.0 + rs)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacdReading {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
    pub signal: String,
}

/// MACD as the EMA12−EMA26 series with an EMA9 signal line.
pub fn macd(closes: &[f64]) -> Result<MacdReading> {
    if closes.len() < 35 {
        bail!("Not enough data for MACD. Got {} points.", closes.len());
    }
    let mut series = Vec::new();
    for i in 26..closes.len() {
        let window = &closes[..=i];
        let ema12 = ema(window, 12)?;
        let ema26 = ema(window, 26)?;
        series.push(ema12 - ema26);
    }
    if series.len() < 9 {
        bail!("Not enough MACD points for signal line.");
    }
    let signal_line = ema(&series, 9)?;
    let macd_line = *series.last().expect("non-empty MACD series");
    let histogram = macd_line - signal_line;
    Ok(MacdReading {
        macd_line,
        signal_line,
        histogram,
        signal: if histogram > 0.0 { "buy" } else { "sell" }.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    pub symbol: String,
    pub rsi_14: f64,
    pub sma_20: f64,
    pub sma_50: f64,
    pub sma_200: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub trend: String,
    pub support: f64,
    pub resistance: f64,
    pub signal: String,
}

/// Composite snapshot. Requires at least 200 closes so SMA-200 is real.
pub fn analyze(symbol: &str, closes: &[f64]) -> Result<TechnicalSnapshot> {
    if closes.len() < 200 {
        bail!(
            "Not enough data for technical analysis. Got {} points.",
            closes.len()
        );
    }
    let sma_20 = sma(closes, 20)?;
    let sma_50 = sma(closes, 50)?;
    let sma_200 = sma(closes, 200)?;
    let rsi_14 = rsi(closes, 14)?;
    let macd_reading = macd(closes)?;

    let recent = &closes[closes.len() - 20..];
    let support = recent.iter().cloned().fold(f64::INFINITY, f64::min);
    let resistance = recent.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let last = *closes.last().expect("non-empty closes");
    let trend = if last > sma_50 { "Bullish" } else { "Bearish" };

    Ok(TechnicalSnapshot {
        symbol: symbol.to_uppercase(),
        rsi_14,
        sma_20,
        sma_50,
        sma_200,
        macd: macd_reading.macd_line,
        macd_signal: macd_reading.signal_line,
        trend: trend.to_string(),
        support,
        resistance,
        signal: macd_reading.signal,
    })
}

/// RSI band label surfaced with single-indicator requests.
pub fn rsi_label(value: f64) -> &'static str {
    if value > 70.0 {
        "overbought"
    } else if value < 30.0 {
        "oversold"
    } else {
        "neutral"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn sma_is_mean_of_tail() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&closes, 3).unwrap(), 4.0);
        assert!(sma(&closes, 6).is_err());
    }

    #[test]
    fn ema_seeds_with_sma() {
        // With exactly `period` points the EMA equals the SMA seed.
        let closes = vec![2.0, 4.0, 6.0];
        assert_eq!(ema(&closes, 3).unwrap(), 4.0);
        // One more point folds in with multiplier 2/(3+1) = 0.5.
        let closes = vec![2.0, 4.0, 6.0, 8.0];
        assert_eq!(ema(&closes, 3).unwrap(), 6.0);
    }

    #[test]
    fn rsi_pegs_at_100_when_losses_are_zero() {
        // Strictly rising closes (and a flat tail) have zero average loss.
        assert_eq!(rsi(&rising(30), 14).unwrap(), 100.0);
        let flat = vec![50.0; 30];
        assert_eq!(rsi(&flat, 14).unwrap(), 100.0);
    }

    #[test]
    fn rsi_midrange_for_alternating_series() {
        let closes: Vec<f64> = (0..40)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let value = rsi(&closes, 14).unwrap();
        assert!(value > 30.0 && value < 70.0, "got {value}");
    }

    #[test]
    fn rsi_insufficient_data() {
        assert!(rsi(&rising(14), 14).is_err());
        assert!(rsi(&rising(15), 14).is_ok());
    }

    #[test]
    fn macd_needs_35_points() {
        assert!(macd(&rising(34)).is_err());
        let reading = macd(&rising(60)).unwrap();
        // In a steady uptrend the 12-EMA sits above the 26-EMA.
        assert!(reading.macd_line > 0.0);
    }

    #[test]
    fn analyze_requires_200_closes() {
        let err = analyze("AAPL", &rising(199)).unwrap_err();
        assert!(err.to_string().contains("199"));
        let snap = analyze("aapl", &rising(250)).unwrap();
        assert_eq!(snap.symbol, "AAPL");
        assert_eq!(snap.trend, "Bullish");
        assert_eq!(snap.rsi_14, 100.0);
        // 20-day extremes of a rising series are its window endpoints.
        assert_eq!(snap.support, 100.0 + 230.0);
        assert_eq!(snap.resistance, 100.0 + 249.0);
    }

    #[test]
    fn analyze_bearish_when_below_sma50() {
        let mut closes = rising(250);
        // Crash the tail below the 50-day average.
        for value in closes.iter_mut().skip(245) {
            *value = 10.0;
        }
        let snap = analyze("TSLA", &closes).unwrap();
        assert_eq!(snap.trend, "Bearish");
    }

    #[test]
    fn rsi_band_labels() {
        assert_eq!(rsi_label(75.0), "overbought");
        assert_eq!(rsi_label(25.0), "oversold");
        assert_eq!(rsi_label(50.0), "neutral");
    }
}
