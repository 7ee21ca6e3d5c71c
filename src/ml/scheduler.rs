//! 検証損失の停滞で学習率を下げるスケジューラ

use crate::model::config::SchedulerSettings;

/// 学習率の変化をこれ未満なら無視する
const LR_EPS: f64 = 1e-8;

/// 損失が `patience` エポックを超えて改善しなければ学習率に `factor` を掛ける
///
/// 改善の判定は相対閾値 (`metric < best * (1 - threshold)`) です。
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    learning_rate: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    best: f64,
    num_bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, settings: &SchedulerSettings) -> Self {
        Self {
            learning_rate: initial_lr,
            factor: settings.factor,
            patience: settings.patience,
            threshold: settings.threshold,
            min_lr: settings.min_lr,
            best: f64::INFINITY,
            num_bad_epochs: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// 1エポック分の損失を与え、次のエポックで使う学習率を返す
    pub fn step(&mut self, metric: f64) -> f64 {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            let reduced = (self.learning_rate * self.factor).max(self.min_lr);
            if self.learning_rate - reduced > LR_EPS {
                log::info!("学習率を減衰: {:.6e} -> {:.6e}", self.learning_rate, reduced);
                self.learning_rate = reduced;
            }
            self.num_bad_epochs = 0;
        }

        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> PlateauScheduler {
        PlateauScheduler::new(0.01, &SchedulerSettings::default())
    }

    #[test]
    fn improving_loss_keeps_learning_rate() {
        let mut s = scheduler();
        for loss in [10.0, 9.0, 8.0, 7.0, 6.0, 5.0] {
            assert_eq!(s.step(loss), 0.01);
        }
    }

    #[test]
    fn fourth_stagnant_epoch_reduces_learning_rate() {
        let mut s = scheduler();
        s.step(5.0);
        for _ in 0..3 {
            assert_eq!(s.step(5.0), 0.01);
        }
        let reduced = s.step(5.0);
        assert!((reduced - 0.01 * 31.0 / 32.0).abs() < 1e-12);

        // カウンタはリセットされ、さらに4エポック停滞するまで据え置き
        for _ in 0..3 {
            assert_eq!(s.step(5.0), reduced);
        }
        assert!(s.step(5.0) < reduced);
    }

    #[test]
    fn tiny_improvement_counts_as_stagnation() {
        let mut s = scheduler();
        s.step(1.0);
        for _ in 0..4 {
            s.step(0.99999);
        }
        assert!(s.learning_rate() < 0.01);
    }

    #[test]
    fn learning_rate_never_drops_below_minimum() {
        let settings = SchedulerSettings {
            factor: 0.1,
            patience: 0,
            threshold: 1e-4,
            min_lr: 0.005,
        };
        let mut s = PlateauScheduler::new(0.01, &settings);
        s.step(1.0);
        for _ in 0..5 {
            s.step(1.0);
        }
        assert_eq!(s.learning_rate(), 0.005);
    }
}
