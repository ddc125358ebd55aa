//! Channel registry: the ordered list of channels a run walks.
//!
//! The registry ships with a built-in default and can be replaced by a TOML
//! file of the form:
//!
//! ```toml
//! default_limit = 5
//!
//! [[channels]]
//! name = "GEARVN"
//! channel_id = "UCdxRpD_T4-HzPsely-Fcezw"
//! language = "vi"
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: usize = 5;

/// Language tag of a channel and of the posts produced from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Vi,
    En,
}

impl Language {
    pub fn as_tag(self) -> &'static str {
        match self {
            Language::Vi => "vi",
            Language::En => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Restricts a run to one language group, or runs every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LanguageSelector {
    Vi,
    En,
    #[default]
    All,
}

impl LanguageSelector {
    pub fn matches(self, language: Language) -> bool {
        match self {
            LanguageSelector::All => true,
            LanguageSelector::Vi => language == Language::Vi,
            LanguageSelector::En => language == Language::En,
        }
    }

    /// Language used for an ad-hoc channel, where "all" has no meaning.
    pub fn single_language(self) -> Language {
        match self {
            LanguageSelector::En => Language::En,
            LanguageSelector::Vi | LanguageSelector::All => Language::Vi,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Display name used for the creator. Empty for ad-hoc channels, in which
    /// case the name reported by YouTube is used.
    #[serde(default)]
    pub name: String,
    pub channel_id: String,
    pub language: Language,
}

impl ChannelEntry {
    pub fn new(name: &str, channel_id: &str, language: Language) -> Self {
        Self {
            name: name.to_owned(),
            channel_id: channel_id.to_owned(),
            language,
        }
    }

    /// A channel passed on the command line rather than taken from the registry.
    pub fn ad_hoc(channel_id: &str, language: Language) -> Self {
        Self::new("", channel_id, language)
    }

    pub fn channel_url(&self) -> String {
        channel_url(&self.channel_id)
    }
}

pub fn channel_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/channel/{channel_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRegistry {
    #[serde(default)]
    pub default_limit: Option<usize>,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

const BUILTIN_VI: &[(&str, &str)] = &[
    ("GEARVN", "UCdxRpD_T4-HzPsely-Fcezw"),
    ("Nguoi Choi Do", "UC3HxHh_jezfVCcXNCyDJHOQ"),
    ("GenZ Viet", "UCMSDj69umhJodE1BLJNxYIw"),
    ("Vinh Xo", "UCyqxvGyF5LO67HI6vdE5bfQ"),
    ("Vat Vo Studio", "UCEeXA5Tu7n9X5_zkOgGsyww"),
    ("Binh Bear", "UCTymg6O7vl87L0c5SdZVAeQ"),
    ("Tai Xai Tech", "UCiYYo7oPjA_MQ9i7-zoNfGA"),
];

const BUILTIN_EN: &[(&str, &str)] = &[
    ("Just Josh", "UCtHm9ai5zSb-yfRnnUBopAg"),
    ("Jarrod's Tech", "UC2Rzju32yQPkQ7oIhmeuLwg"),
    ("NoodleNick", "UCthAJeiDA_7iKyzYElbrgjg"),
];

impl ChannelRegistry {
    /// The default channel set: Vietnamese group first, then English.
    pub fn builtin() -> Self {
        let vi = BUILTIN_VI
            .iter()
            .map(|(name, id)| ChannelEntry::new(name, id, Language::Vi));
        let en = BUILTIN_EN
            .iter()
            .map(|(name, id)| ChannelEntry::new(name, id, Language::En));
        Self {
            default_limit: Some(DEFAULT_LIMIT),
            channels: vi.chain(en).collect(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let registry: ChannelRegistry = toml::from_str(raw).context("parsing channel registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading channel registry {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.default_limit == Some(0) {
            bail!("default_limit must be a positive integer");
        }
        for entry in &self.channels {
            if entry.channel_id.trim().is_empty() {
                bail!("channel {:?} has an empty channel_id", entry.name);
            }
        }
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.default_limit.unwrap_or(DEFAULT_LIMIT)
    }

    /// Channels of the selected group(s), ordered by language group and then
    /// by registry order within each group.
    pub fn select(&self, selector: LanguageSelector) -> Vec<&ChannelEntry> {
        [Language::Vi, Language::En]
            .into_iter()
            .filter(|language| selector.matches(*language))
            .flat_map(|language| {
                self.channels
                    .iter()
                    .filter(move |entry| entry.language == language)
            })
            .collect()
    }
}
