use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecapError {
    #[error("Missing required column: {field}")]
    Schema { field: String },

    #[error("Column not found in target header: {0}")]
    InvalidColumn(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Parse error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Parse error: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("Parse error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("Parse error: {0}")]
    Xlsx(#[from] calamine::XlsxError),

    #[error("Parse error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl RecapError {
    pub fn schema(field: impl Into<String>) -> Self {
        Self::Schema { field: field.into() }
    }

    /// True for every failure to decode input bytes or locate a named sheet.
    pub fn is_parse(&self) -> bool {
        matches!(
            self,
            Self::Parse(_)
                | Self::Zip(_)
                | Self::Xml(_)
                | Self::XmlAttr(_)
                | Self::Spreadsheet(_)
                | Self::Xlsx(_)
                | Self::Csv(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RecapError>;
