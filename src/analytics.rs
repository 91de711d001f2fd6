// ===============================
// src/analytics.rs
// ===============================
//
// Pipeline murni: harga -> sinyal band (mean ± 1 std, window 24 jam) -> PnL.
//
// Sinyal per titik (setelah window penuh):
//   price > mu + sigma  -> Long  (+1)
//   price < mu - sigma  -> Short (-1)
//   selain itu          -> ikut sinyal sebelumnya (Flat bila belum pernah tembus)
// Titik sebelum window penuh: None.
//
// PnL: pnl[t] = signal[t-1] * (price[t] - price[t-1]); titik pertama None.
//
use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::Frequency;
use crate::domain::{PriceHistory, PricePoint, ReportRow, Signal};

/// Rolling mean and sample standard deviation over a fixed window.
///
/// Sums are kept relative to the first observed value so long windows of
/// similar prices do not lose precision to cancellation.
pub struct RollingBand {
    w: usize,
    window: VecDeque<f64>,
    shift: Option<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingBand {
    pub fn new(w: usize) -> Self {
        Self { w, window: VecDeque::with_capacity(w), shift: None, sum: 0.0, sum_sq: 0.0 }
    }

    /// Push one price; returns `(mean, std)` once the window is full.
    pub fn update(&mut self, price: f64) -> Option<(f64, f64)> {
        if self.w < 2 {
            return None;
        }
        let k = *self.shift.get_or_insert(price);
        if self.window.len() == self.w {
            if let Some(x) = self.window.pop_front() {
                let d = x - k;
                self.sum -= d;
                self.sum_sq -= d * d;
            }
        }
        let d = price - k;
        self.window.push_back(price);
        self.sum += d;
        self.sum_sq += d * d;

        if self.window.len() < self.w {
            return None;
        }
        let n = self.w as f64;
        let mean_d = self.sum / n;
        let var = ((self.sum_sq - self.sum * mean_d) / (n - 1.0)).max(0.0);
        Some((k + mean_d, var.sqrt()))
    }
}

pub fn compute_signals(prices: &[f64], window: usize) -> Vec<Option<Signal>> {
    let mut band = RollingBand::new(window);
    let mut last: Option<Signal> = None;
    let mut out = Vec::with_capacity(prices.len());

    for &p in prices {
        let sig = band.update(p).map(|(mu, sigma)| {
            let s = if p > mu + sigma {
                Signal::Long
            } else if p < mu - sigma {
                Signal::Short
            } else {
                last.unwrap_or(Signal::Flat)
            };
            last = Some(s);
            s
        });
        out.push(sig);
    }
    out
}

pub fn compute_pnl(prices: &[f64], signals: &[Option<Signal>]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(prices.len());
    for t in 0..prices.len() {
        if t == 0 {
            out.push(None);
            continue;
        }
        let pnl = signals.get(t - 1).copied().flatten().map(|s| match s {
            Signal::Flat => 0.0,
            _ => s.sign() as f64 * (prices[t] - prices[t - 1]),
        });
        out.push(pnl);
    }
    out
}

fn floor_to_grid(ts: DateTime<Utc>, freq: Frequency) -> Option<DateTime<Utc>> {
    let step = freq.minutes() as i64 * 60;
    let secs = ts.timestamp().div_euclid(step) * step;
    DateTime::from_timestamp(secs, 0)
}

/// Snap points to the sampling grid: last value per slot wins, non-finite
/// prices are dropped and holes between the first and last slot are
/// forward-filled, so the result is a gap-free run.
pub fn align_to_grid(points: &[PricePoint], freq: Frequency) -> Vec<PricePoint> {
    let mut slotted: Vec<PricePoint> = points
        .iter()
        .filter(|p| p.price.is_finite())
        .filter_map(|p| floor_to_grid(p.ts, freq).map(|ts| PricePoint { ts, price: p.price }))
        .collect();
    // stable: untuk slot yang sama, urutan asli dipertahankan -> yang terakhir menang
    slotted.sort_by_key(|p| p.ts);

    let step = freq.step();
    let mut out: Vec<PricePoint> = Vec::with_capacity(slotted.len());
    for p in slotted {
        match out.last_mut() {
            Some(last) if last.ts == p.ts => last.price = p.price,
            Some(last) => {
                let (mut ts, fill) = (last.ts + step, last.price);
                while ts < p.ts {
                    out.push(PricePoint { ts, price: fill });
                    ts += step;
                }
                out.push(p);
            }
            None => out.push(p),
        }
    }
    out
}

/// Full pipeline for every ticker in `history`; rows ordered by (timestamp, ticker).
pub fn build_rows(history: &PriceHistory, freq: Frequency) -> Vec<ReportRow> {
    let window = freq.window_len();
    let mut rows = Vec::new();

    for (ticker, points) in history {
        let aligned = align_to_grid(points, freq);
        let prices: Vec<f64> = aligned.iter().map(|p| p.price).collect();
        let signals = compute_signals(&prices, window);
        let pnl = compute_pnl(&prices, &signals);

        for (i, p) in aligned.iter().enumerate() {
            rows.push(ReportRow {
                timestamp: p.ts,
                ticker: ticker.clone(),
                price: p.price,
                signal: signals[i],
                pnl: pnl[i],
            });
        }
    }
    rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.ticker.cmp(&b.ticker)));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use std::f64::consts::PI;

    fn oscillating(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + (i as f64 * 2.0 * PI / 60.0).sin()).collect()
    }

    fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap() }

    #[test]
    fn band_matches_two_pass_sample_std() {
        let prices = [10.0, 12.0, 11.0, 15.0, 9.0, 13.0];
        let mut band = RollingBand::new(4);
        let mut last = None;
        for p in prices {
            last = band.update(p);
        }
        let win = &prices[2..];
        let mean = win.iter().sum::<f64>() / 4.0;
        let var = win.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 3.0;
        let (mu, sigma) = last.unwrap();
        assert!((mu - mean).abs() < 1e-12);
        assert!((sigma - var.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn no_signal_before_first_full_window() {
        let prices = oscillating(100);
        let sig = compute_signals(&prices, 24);
        assert!(sig[..23].iter().all(|s| s.is_none()));
        assert!(sig[23..].iter().all(|s| s.is_some()));
    }

    #[test]
    fn sustained_spike_turns_signal_long() {
        let mut prices = oscillating(1500);
        for p in prices.iter_mut().skip(1400) {
            *p += 10.0;
        }
        let sig = compute_signals(&prices, Frequency::M1.window_len());
        assert_eq!(sig[1400], None);
        assert_eq!(sig[1439], Some(Signal::Long));
        assert!(sig[1439..].iter().all(|s| *s == Some(Signal::Long)));
    }

    #[test]
    fn inside_band_carries_previous_signal() {
        // window 3: flat, lalu tembus atas, lalu kembali ke dalam band
        let prices = [1.0, 1.0, 1.0, 5.0, 4.0, 4.0];
        let sig = compute_signals(&prices, 3);
        assert_eq!(sig[2], Some(Signal::Flat));
        assert_eq!(sig[3], Some(Signal::Long));
        assert_eq!(sig[5], Some(Signal::Long));
    }

    #[test]
    fn pnl_uses_previous_signal() {
        let prices = [10.0, 11.0, 13.0, 12.0];
        let signals = [None, Some(Signal::Long), Some(Signal::Short), Some(Signal::Flat)];
        let pnl = compute_pnl(&prices, &signals);
        assert_eq!(pnl, vec![None, None, Some(2.0), Some(1.0)]);
    }

    fn arb_signal() -> impl Strategy<Value = Option<Signal>> {
        prop_oneof![Just(None), Just(Some(Signal::Short)), Just(Some(Signal::Flat)), Just(Some(Signal::Long))]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn pnl_depends_only_on_prior_signal_and_price_change(
            prices in prop::collection::vec(1.0f64..1000.0, 3..40),
            signals in prop::collection::vec(arb_signal(), 40),
            t_seed in any::<usize>(),
            j_seed in any::<usize>(),
            bump in 1.0f64..50.0,
            other in arb_signal(),
        ) {
            let n = prices.len();
            let signals = &signals[..n];
            let t = 1 + t_seed % (n - 1);
            let base = compute_pnl(&prices, signals)[t];

            let j = j_seed % n;
            if j != t && j != t - 1 {
                let mut moved = prices.clone();
                moved[j] += bump;
                prop_assert_eq!(compute_pnl(&moved, signals)[t], base);
            }

            let k = j_seed % n;
            if k != t - 1 {
                let mut resigned = signals.to_vec();
                resigned[k] = other;
                prop_assert_eq!(compute_pnl(&prices, &resigned)[t], base);
            }
        }

        #[test]
        fn signals_are_bounded_and_start_after_window(
            prices in prop::collection::vec(50.0f64..150.0, 24..120),
        ) {
            let sig = compute_signals(&prices, 24);
            prop_assert!(sig[..23].iter().all(|s| s.is_none()));
            prop_assert!(sig[23..].iter().all(|s| matches!(s, Some(x) if (-1..=1).contains(&x.sign()))));
        }
    }

    #[test]
    fn align_snaps_and_forward_fills() {
        let pts = vec![
            PricePoint { ts: t0() + Duration::seconds(20), price: 1.0 },
            PricePoint { ts: t0() + Duration::seconds(50), price: 2.0 },
            PricePoint { ts: t0() + Duration::minutes(3), price: f64::NAN },
            PricePoint { ts: t0() + Duration::minutes(4), price: 4.0 },
        ];
        let out = align_to_grid(&pts, Frequency::M1);
        let got: Vec<(i64, f64)> = out.iter().map(|p| ((p.ts - t0()).num_minutes(), p.price)).collect();
        assert_eq!(got, vec![(0, 2.0), (1, 2.0), (2, 2.0), (3, 2.0), (4, 4.0)]);
    }

    #[test]
    fn build_rows_is_deterministic_and_ordered() {
        let mut history = PriceHistory::new();
        for (ticker, offset) in [("MSFT", 300.0), ("AAPL", 100.0)] {
            let pts = oscillating(60)
                .into_iter()
                .enumerate()
                .map(|(i, p)| PricePoint { ts: t0() + Duration::hours(i as i64), price: p + offset })
                .collect();
            history.insert(ticker.to_string(), pts);
        }
        let a = build_rows(&history, Frequency::M60);
        let b = build_rows(&history, Frequency::M60);
        assert_eq!(a, b);
        assert_eq!(a.len(), 120);
        assert_eq!((a[0].ticker.as_str(), a[1].ticker.as_str()), ("AAPL", "MSFT"));
        assert!(a.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(a.iter().filter(|r| r.ticker == "AAPL").take(23).all(|r| r.signal.is_none()));
    }
}
