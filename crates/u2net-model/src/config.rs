//! Stage tables and enumerations that drive U2-Net construction.
//!
//! A [`StageTable`] is a declarative description of every encoder and decoder
//! stage of the nested network. The two published variants are available
//! through [`StageTable::full`] and [`StageTable::lite`]; custom tables are
//! validated by [`StageTable::validate`] before any parameter is allocated.

use burn::prelude::*;

use crate::error::{U2NetError, U2NetResult};

/// The published U2-Net sizes.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum U2NetVariant {
    /// The full-width network (about 44M parameters).
    Full,
    /// The reduced-width network with 64 channels everywhere.
    Lite,
}

impl U2NetVariant {
    /// Lower-case name used on the command line and in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Lite => "lite",
        }
    }
}

impl core::str::FromStr for U2NetVariant {
    type Err = U2NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "lite" => Ok(Self::Lite),
            other => Err(U2NetError::InvalidConfiguration {
                reason: format!("unknown U2-Net variant `{other}`, expected `full` or `lite`"),
            }),
        }
    }
}

/// Resampling mode used to bring decoder outputs back to the skip resolution.
///
/// Burn only provides a backward pass for nearest interpolation on some
/// backends, so training on those backends must select `Nearest`.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum UpsampleMode {
    /// Bilinear interpolation.
    Bilinear,
    /// Nearest-neighbour interpolation (differentiable on every backend).
    Nearest,
}

impl Default for UpsampleMode {
    fn default() -> Self {
        Self::Bilinear
    }
}

/// Description of a single residual U-block stage.
#[derive(Config, Debug, PartialEq, Eq)]
pub struct StageConfig {
    /// Stage label, e.g. `En_1` or `De_3`. Only used in diagnostics.
    pub name: String,
    /// Recursion height of the stage's residual U-block.
    pub height: usize,
    /// Number of input channels.
    pub in_channels: usize,
    /// Width of the inner encoder/decoder blocks.
    pub mid_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Use growing dilation instead of pooling inside the block.
    #[config(default = false)]
    pub dilated: bool,
    /// Input channels of the side-output head attached to this stage.
    #[config(default = "None")]
    pub side: Option<usize>,
}

impl StageConfig {
    fn stage(
        name: &str,
        height: usize,
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
    ) -> Self {
        Self::new(
            name.to_owned(),
            height,
            in_channels,
            mid_channels,
            out_channels,
        )
    }

    fn check(&self) -> U2NetResult<()> {
        if self.height < 2 {
            return Err(invalid(format!(
                "stage {} has height {}, the minimum is 2",
                self.name, self.height
            )));
        }
        if self.in_channels == 0 || self.mid_channels == 0 || self.out_channels == 0 {
            return Err(invalid(format!(
                "stage {} has a zero channel count ({} -> {} -> {})",
                self.name, self.in_channels, self.mid_channels, self.out_channels
            )));
        }
        if let Some(side) = self.side {
            if side != self.out_channels {
                return Err(invalid(format!(
                    "stage {} feeds a side head with {side} channels but outputs {}",
                    self.name, self.out_channels
                )));
            }
        }
        Ok(())
    }
}

/// Encoder and decoder stages of a U2-Net, both indexed by depth.
///
/// `encoders[d - 1]` is the encoder stage at depth `d`; the last encoder is the
/// bottleneck. `decoders[d - 1]` is the decoder stage at depth `d`, so there is
/// one decoder fewer than there are encoders.
#[derive(Config, Debug, PartialEq, Eq)]
pub struct StageTable {
    /// Encoder stages, shallowest first.
    pub encoders: Vec<StageConfig>,
    /// Decoder stages, shallowest first.
    pub decoders: Vec<StageConfig>,
}

impl StageTable {
    /// The full-width table.
    pub fn full() -> Self {
        let encoders = vec![
            StageConfig::stage("En_1", 7, 3, 32, 64),
            StageConfig::stage("En_2", 6, 64, 32, 128),
            StageConfig::stage("En_3", 5, 128, 64, 256),
            StageConfig::stage("En_4", 4, 256, 128, 512),
            StageConfig::stage("En_5", 4, 512, 256, 512).with_dilated(true),
            StageConfig::stage("En_6", 4, 512, 256, 512)
                .with_dilated(true)
                .with_side(Some(512)),
        ];
        let decoders = vec![
            StageConfig::stage("De_1", 7, 128, 16, 64).with_side(Some(64)),
            StageConfig::stage("De_2", 6, 256, 32, 64).with_side(Some(64)),
            StageConfig::stage("De_3", 5, 512, 64, 128).with_side(Some(128)),
            StageConfig::stage("De_4", 4, 1024, 128, 256).with_side(Some(256)),
            StageConfig::stage("De_5", 4, 1024, 256, 512)
                .with_dilated(true)
                .with_side(Some(512)),
        ];
        Self::new(encoders, decoders)
    }

    /// The lite table.
    pub fn lite() -> Self {
        let encoders = vec![
            StageConfig::stage("En_1", 7, 3, 32, 64),
            StageConfig::stage("En_2", 6, 64, 32, 64),
            StageConfig::stage("En_3", 5, 64, 32, 64),
            StageConfig::stage("En_4", 4, 64, 32, 64),
            StageConfig::stage("En_5", 4, 64, 32, 64).with_dilated(true),
            StageConfig::stage("En_6", 4, 64, 32, 64)
                .with_dilated(true)
                .with_side(Some(64)),
        ];
        let decoders = vec![
            StageConfig::stage("De_1", 7, 128, 32, 64).with_side(Some(64)),
            StageConfig::stage("De_2", 6, 128, 32, 64).with_side(Some(64)),
            StageConfig::stage("De_3", 5, 128, 32, 64).with_side(Some(64)),
            StageConfig::stage("De_4", 4, 128, 32, 64).with_side(Some(64)),
            StageConfig::stage("De_5", 4, 128, 32, 64)
                .with_dilated(true)
                .with_side(Some(64)),
        ];
        Self::new(encoders, decoders)
    }

    /// The table of a published variant.
    pub fn for_variant(variant: &U2NetVariant) -> Self {
        match variant {
            U2NetVariant::Full => Self::full(),
            U2NetVariant::Lite => Self::lite(),
        }
    }

    /// Replaces the input width of the first encoder stage.
    pub fn with_in_channels(mut self, in_channels: usize) -> Self {
        if let Some(first) = self.encoders.first_mut() {
            first.in_channels = in_channels;
        }
        self
    }

    /// Number of encoder stages, i.e. the nesting height of the network.
    pub fn height(&self) -> usize {
        self.encoders.len()
    }

    /// Number of input channels the network expects.
    pub fn in_channels(&self) -> usize {
        self.encoders.first().map_or(0, |stage| stage.in_channels)
    }

    /// Number of stages carrying a side-output head.
    pub fn side_count(&self) -> usize {
        self.encoders
            .iter()
            .chain(self.decoders.iter())
            .filter(|stage| stage.side.is_some())
            .count()
    }

    /// Checks that consecutive stages agree on their channel counts.
    ///
    /// # Errors
    ///
    /// Returns [`U2NetError::InvalidConfiguration`] describing the first
    /// inconsistency found.
    pub fn validate(&self) -> U2NetResult<()> {
        let height = self.height();
        if height < 2 {
            return Err(invalid(format!(
                "a U2-Net needs at least 2 encoder stages, got {height}"
            )));
        }
        if self.decoders.len() != height - 1 {
            return Err(invalid(format!(
                "{height} encoder stages need {} decoder stages, got {}",
                height - 1,
                self.decoders.len()
            )));
        }

        for stage in self.encoders.iter().chain(self.decoders.iter()) {
            stage.check()?;
        }

        for pair in self.encoders.windows(2) {
            if pair[0].out_channels != pair[1].in_channels {
                return Err(invalid(format!(
                    "{} outputs {} channels but {} expects {}",
                    pair[0].name, pair[0].out_channels, pair[1].name, pair[1].in_channels
                )));
            }
        }

        for (index, decoder) in self.decoders.iter().enumerate() {
            let skip = &self.encoders[index];
            let deeper = if index + 1 == self.decoders.len() {
                &self.encoders[index + 1]
            } else {
                &self.decoders[index + 1]
            };
            let expected = skip.out_channels + deeper.out_channels;
            if decoder.in_channels != expected {
                return Err(invalid(format!(
                    "{} concatenates {} ({}) and {} ({}) but expects {} channels",
                    decoder.name,
                    deeper.name,
                    deeper.out_channels,
                    skip.name,
                    skip.out_channels,
                    decoder.in_channels
                )));
            }
        }

        if let Some(stage) = self.encoders[..height - 1]
            .iter()
            .find(|stage| stage.side.is_some())
        {
            return Err(invalid(format!(
                "only the bottleneck encoder may carry a side output, {} declares one",
                stage.name
            )));
        }

        if self.side_count() == 0 {
            return Err(invalid("no stage declares a side output".to_owned()));
        }

        Ok(())
    }
}

fn invalid(reason: String) -> U2NetError {
    U2NetError::InvalidConfiguration { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_tables_are_consistent() {
        for table in [StageTable::full(), StageTable::lite()] {
            assert!(table.validate().is_ok());
            assert_eq!(table.height(), 6);
            assert_eq!(table.decoders.len(), 5);
            assert_eq!(table.side_count(), 6);
            assert_eq!(table.in_channels(), 3);
        }
    }

    #[test]
    fn dilated_stages_match_the_bottleneck_region() {
        for table in [StageTable::full(), StageTable::lite()] {
            let dilated: Vec<&str> = table
                .encoders
                .iter()
                .chain(table.decoders.iter())
                .filter(|stage| stage.dilated)
                .map(|stage| stage.name.as_str())
                .collect();
            assert_eq!(dilated, ["En_5", "En_6", "De_5"]);
        }
    }

    #[test]
    fn full_decoder_widths_follow_the_table() {
        let table = StageTable::full();
        let decoder_one = &table.decoders[0];
        assert_eq!(
            (
                decoder_one.height,
                decoder_one.in_channels,
                decoder_one.mid_channels,
                decoder_one.out_channels
            ),
            (7, 128, 16, 64)
        );
        let bottleneck = &table.encoders[5];
        assert_eq!(bottleneck.side, Some(512));
    }

    #[test]
    fn with_in_channels_rewrites_only_the_first_stage() {
        let table = StageTable::lite().with_in_channels(1);
        assert_eq!(table.in_channels(), 1);
        assert_eq!(table.encoders[1].in_channels, 64);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn mismatched_decoder_input_is_rejected() {
        let mut table = StageTable::lite();
        table.decoders[2].in_channels = 96;
        match table.validate() {
            Err(U2NetError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("De_3"), "unexpected reason: {reason}");
            }
            other => panic!("expected an invalid configuration, got {other:?}"),
        }
    }

    #[test]
    fn broken_encoder_chain_is_rejected() {
        let mut table = StageTable::full();
        table.encoders[2].in_channels = 64;
        assert!(matches!(
            table.validate(),
            Err(U2NetError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn height_below_two_is_rejected() {
        let mut table = StageTable::lite();
        table.encoders[3].height = 1;
        assert!(table.validate().is_err());
    }

    #[test]
    fn side_width_must_match_stage_output() {
        let mut table = StageTable::lite();
        table.decoders[0].side = Some(32);
        assert!(table.validate().is_err());
    }

    #[test]
    fn side_on_shallow_encoder_is_rejected() {
        let mut table = StageTable::lite();
        table.encoders[0].side = Some(64);
        assert!(table.validate().is_err());
    }

    #[test]
    fn decoder_count_must_be_one_less_than_encoders() {
        let mut table = StageTable::lite();
        table.decoders.pop();
        assert!(table.validate().is_err());
    }

    #[test]
    fn variant_parses_case_insensitively() {
        assert_eq!("Full".parse::<U2NetVariant>().ok(), Some(U2NetVariant::Full));
        assert_eq!("lite".parse::<U2NetVariant>().ok(), Some(U2NetVariant::Lite));
        assert!("medium".parse::<U2NetVariant>().is_err());
        assert_eq!(U2NetVariant::Lite.name(), "lite");
    }

    #[test]
    fn table_displays_as_json() {
        let rendered = StageTable::full().to_string();
        assert!(rendered.contains("\"En_6\""));
        assert!(rendered.contains("\"dilated\":true"));
    }
}
