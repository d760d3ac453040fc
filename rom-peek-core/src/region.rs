use serde::Serialize;

/// Release regions, as encoded in game IDs and region bitmasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Region {
    Japan,
    Usa,
    Europe,
    Australia,
    Korea,
    China,
    Taiwan,
    World,
    Unknown,
}

impl Region {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Japan => "Japan",
            Self::Usa => "USA",
            Self::Europe => "Europe",
            Self::Australia => "Australia",
            Self::Korea => "Korea",
            Self::China => "China",
            Self::Taiwan => "Taiwan",
            Self::World => "World",
            Self::Unknown => "Unknown",
        }
    }

    /// GameTDB two-letter region directory name.
    pub fn gametdb_code(&self) -> &'static str {
        match self {
            Self::Japan => "JA",
            Self::Usa => "US",
            Self::Europe => "EN",
            Self::Australia => "AU",
            Self::Korea => "KO",
            Self::China => "ZH",
            Self::Taiwan => "ZH",
            Self::World | Self::Unknown => "EN",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
