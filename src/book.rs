
use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;

pub const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Book {
    pub id: i64,
    pub book_name: String,
    pub author_name: String,
    pub isbn: String,
    pub price: f64,
    pub quantity: i64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewBook {
    pub book_name: String,
    pub author_name: String,
    pub isbn: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub description: String,
}

/// Exactly 13 ASCII digits.
pub fn is_valid_isbn(isbn: &str) -> bool {
    isbn.len() == 13 && isbn.bytes().all(|b| b.is_ascii_digit())
}

impl NewBook {
    pub fn into_book(self, id: i64) -> Book {
        Book {
            id,
            book_name: self.book_name,
            author_name: self.author_name,
            isbn: self.isbn,
            price: self.price,
            quantity: self.quantity,
            description: self.description,
        }
    }

    /// Trims text fields and rounds the price to cents, then checks every
    /// field. All problems are reported at once.
    pub fn validate(mut self) -> Result<NewBook, ValidationErrors> {
        self.book_name = self.book_name.trim().to_string();
        self.author_name = self.author_name.trim().to_string();
        self.isbn = self.isbn.trim().to_string();
        self.price = (self.price * 100.0).round() / 100.0;

        let mut errors = ValidationErrors::default();
        for (field, value) in [("book_name", &self.book_name), ("author_name", &self.author_name)] {
            if value.is_empty() {
                errors.add(field, "This field may not be blank.");
            } else if value.chars().count() > MAX_NAME_LEN {
                errors.add(field, format!("Ensure this field has no more than {MAX_NAME_LEN} characters."));
            }
        }
        if !is_valid_isbn(&self.isbn) {
            errors.add("isbn", "ISBN must be 13 digits");
        }
        if !self.price.is_finite() || self.price < 0.0 {
            errors.add("price", "Ensure this value is greater than or equal to 0.");
        }
        if self.quantity < 0 {
            errors.add("quantity", "Ensure this value is greater than or equal to 0.");
        }

        if errors.is_empty() { Ok(self) } else { Err(errors) }
    }
}
