use std::collections::{HashMap, HashSet};

/// Output of the external file-parsing collaborator: ordered column names
/// plus ordered rows of column→text mappings. How the file was read (CSV,
/// spreadsheet, ...) is not the engine's concern.
#[derive(Debug, Clone)]
pub struct ParsedSheet {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, String>>,
}

#[derive(thiserror::Error, Debug)]
#[error("recipient source is not available: {0}")]
pub struct SourceUnavailable(pub String);

/// The collaborator that yields the recipient batch.
pub trait RecipientSource: Send + Sync {
    fn parse(&self) -> Result<ParsedSheet, SourceUnavailable>;
}

#[derive(thiserror::Error, Debug)]
pub enum NormalizeError {
    #[error("column \"{0}\" is not present in the parsed sheet")]
    MissingColumn(String),
    #[error("no row has a non-empty \"{0}\" value")]
    NoValidRecipients(String),
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub email: String,
    pub row: HashMap<String, String>,
}

/// Filter the parsed rows down to the batch the dispatch loop will process.
///
/// A row is valid iff the trimmed value of the email column is non-empty;
/// invalid rows are dropped silently before totals are computed. Duplicate
/// addresses keep their first row. Source order is preserved.
pub fn normalize_recipients(
    sheet: &ParsedSheet,
    email_column: &str,
) -> Result<Vec<Recipient>, NormalizeError> {
    if !sheet.columns.iter().any(|c| c == email_column) {
        return Err(NormalizeError::MissingColumn(email_column.to_owned()));
    }

    let mut seen = HashSet::new();
    let recipients: Vec<Recipient> = sheet
        .rows
        .iter()
        .filter_map(|row| {
            let email = row.get(email_column).map(|v| v.trim()).unwrap_or("");
            if email.is_empty() || !seen.insert(email.to_owned()) {
                return None;
            }
            Some(Recipient {
                email: email.to_owned(),
                row: row.clone(),
            })
        })
        .collect();

    if recipients.is_empty() {
        return Err(NormalizeError::NoValidRecipients(email_column.to_owned()));
    }

    Ok(recipients)
}
