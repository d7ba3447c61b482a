//! Per-epoch training curves, persisted as JSON next to the checkpoints.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Scores of one epoch. Validation scores are `None` when no validation
/// image had a lesion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train_loss: f64,
    /// Mean soft Dice score (1 - Dice loss) over training batches.
    pub train_dice: f64,
    pub val_loss: Option<f64>,
    pub val_dice: Option<f64>,
    pub val_iou: Option<f64>,
}

/// Training curves of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Best validation Dice so far, with its epoch.
    pub fn best_val_dice(&self) -> Option<(usize, f64)> {
        self.epochs
            .iter()
            .filter_map(|record| record.val_dice.map(|dice| (record.epoch, dice)))
            .fold(None, |best, (epoch, dice)| match best {
                Some((_, best_dice)) if best_dice > dice => best,
                _ => Some((epoch, dice)),
            })
    }

    /// Loads a history from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let history_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read history {}", path.display()))?;
        let history = serde_json::from_str(&history_str)
            .with_context(|| format!("failed to parse history {}", path.display()))?;
        Ok(history)
    }

    /// Saves this history to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let history_str = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), history_str)
            .with_context(|| format!("failed to write history {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, val_dice: Option<f64>) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: 1.0 / epoch as f64,
            train_dice: 0.1 * epoch as f64,
            val_loss: Some(0.9 / epoch as f64),
            val_dice,
            val_iou: val_dice.map(|dice| dice / 2.0),
        }
    }

    #[test]
    fn best_val_dice_prefers_the_latest_tie() {
        let mut history = TrainingHistory::new();
        assert_eq!(history.best_val_dice(), None);

        history.push(record(1, Some(0.4)));
        history.push(record(2, None));
        history.push(record(3, Some(0.6)));
        history.push(record(4, Some(0.6)));
        history.push(record(5, Some(0.5)));
        assert_eq!(history.best_val_dice(), Some((4, 0.6)));
    }

    #[test]
    fn history_survives_a_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut history = TrainingHistory::new();
        history.push(record(1, Some(0.25)));
        history.push(record(2, None));

        history.save(&path).unwrap();
        assert_eq!(TrainingHistory::load(&path).unwrap(), history);
    }

    #[test]
    fn loading_a_missing_file_names_it() {
        let err = TrainingHistory::load("/nonexistent/history.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/history.json"));
    }
}
