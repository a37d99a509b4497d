use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Written in place of a field the page did not provide.
pub(crate) const ABSENT: &str = "N/A";
/// Written in every field of a unit that could not be fetched at all.
pub(crate) const NOT_EXTRACTED: &str = "Not Extracted";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";


/// A single cell of a [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum Field {
    Value(String),
    #[default]
    Absent,
    NotExtracted
}


impl Field {
    /// Builds a field from scraped text, treating blank text as absent.
    pub(crate) fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            Field::Absent
        } else if trimmed.len() == text.len() {
            Field::Value(text)
        } else {
            Field::Value(trimmed.to_string())
        }
    }

    fn parse(cell: &str) -> Self {
        match cell {
            ABSENT => Field::Absent,
            NOT_EXTRACTED => Field::NotExtracted,
            other => Field::from_text(other)
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            Field::Value(value) => value,
            Field::Absent => ABSENT,
            Field::NotExtracted => NOT_EXTRACTED
        }
    }

    pub(crate) fn value(&self) -> Option<&str> {
        match self {
            Field::Value(value) => Some(value),
            _ => None
        }
    }
}


impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}


impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let cell = String::deserialize(deserializer)?;
        Ok(Field::parse(&cell))
    }
}


/// One job posting, as written to a row of the output file.
///
/// The column names double as the CSV header, so renaming a field here
/// changes the file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    #[serde(rename = "Title")]
    pub(crate) title: Field,
    #[serde(rename = "Company")]
    pub(crate) company: Field,
    #[serde(rename = "Location")]
    pub(crate) location: Field,
    #[serde(rename = "Salary")]
    pub(crate) salary: Field,
    #[serde(rename = "Contract Type")]
    pub(crate) contract_type: Field,
    #[serde(rename = "Category")]
    pub(crate) category: Field,
    #[serde(rename = "Experience")]
    pub(crate) experience: Field,
    #[serde(rename = "Skills")]
    pub(crate) skills: Field,
    #[serde(rename = "Languages")]
    pub(crate) languages: Field,
    #[serde(rename = "Gender")]
    pub(crate) gender: Field,
    #[serde(rename = "Military Status")]
    pub(crate) military_status: Field,
    #[serde(rename = "Education Level")]
    pub(crate) education: Field,
    #[serde(rename = "Urgency")]
    pub(crate) urgency: Field,
    #[serde(rename = "Description")]
    pub(crate) description: Field,
    #[serde(rename = "Company Introduction")]
    pub(crate) company_intro: Field,
    #[serde(rename = "Page")]
    pub(crate) page: Field,
    #[serde(rename = "Link")]
    pub(crate) link: String,
    #[serde(rename = "Extracted At")]
    pub(crate) extracted_at: String
}


impl JobRecord {
    pub(crate) const HEADERS: [&'static str; 18] = [
        "Title", "Company", "Location", "Salary", "Contract Type", "Category", "Experience",
        "Skills", "Languages", "Gender", "Military Status", "Education Level", "Urgency",
        "Description", "Company Introduction", "Page", "Link", "Extracted At"
    ];

    pub(crate) fn new(link: impl Into<String>) -> Self {
        Self {
            title: Field::Absent,
            company: Field::Absent,
            location: Field::Absent,
            salary: Field::Absent,
            contract_type: Field::Absent,
            category: Field::Absent,
            experience: Field::Absent,
            skills: Field::Absent,
            languages: Field::Absent,
            gender: Field::Absent,
            military_status: Field::Absent,
            education: Field::Absent,
            urgency: Field::Absent,
            description: Field::Absent,
            company_intro: Field::Absent,
            page: Field::Absent,
            link: link.into(),
            extracted_at: now_stamp()
        }
    }

    /// Stands in for a unit whose page never loaded.
    pub(crate) fn placeholder(link: impl Into<String>, page: Option<u64>) -> Self {
        let mut record = Self::new(link);
        for field in record.fields_mut() {
            *field = Field::NotExtracted;
        }
        if let Some(page) = page {
            record.page = Field::Value(page.to_string());
        }
        record
    }

    pub(crate) fn with_page(mut self, page: Option<u64>) -> Self {
        if let Some(page) = page {
            self.page = Field::Value(page.to_string());
        }
        self
    }

    pub(crate) fn is_placeholder(&self) -> bool {
        self.title == Field::NotExtracted
    }

    fn fields_mut(&mut self) -> [&mut Field; 15] {
        [
            &mut self.title,
            &mut self.company,
            &mut self.location,
            &mut self.salary,
            &mut self.contract_type,
            &mut self.category,
            &mut self.experience,
            &mut self.skills,
            &mut self.languages,
            &mut self.gender,
            &mut self.military_status,
            &mut self.education,
            &mut self.urgency,
            &mut self.description,
            &mut self.company_intro,
        ]
    }
}


pub(crate) fn now_stamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}
