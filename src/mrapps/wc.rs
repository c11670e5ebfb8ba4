use std::str::CharIndices;

use regex::Regex;

use crate::mr::{Accumulator, Document, KeyValue, MapFunction, Pairs, ReduceFunction, SumReducer};

/// Word count over runs of alphabetic characters.
pub struct WC;

impl MapFunction for WC {
    fn map<'a>(&'a self, doc: &'a Document) -> Pairs<'a> {
        Box::new(Words::new(doc.text()).map(|w| Ok::<_, anyhow::Error>(KeyValue::new(w, 1))))
    }
}

impl ReduceFunction for WC {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        SumReducer.reduce(acc, kv)
    }
}

/// Maximal runs of alphabetic characters, in order.
pub struct Words<'a> {
    text: &'a str,
    chars: CharIndices<'a>,
}

impl<'a> Words<'a> {
    pub fn new(text: &'a str) -> Self {
        Words { text, chars: text.char_indices() }
    }
}

impl<'a> Iterator for Words<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let start = loop {
            let (i, c) = self.chars.next()?;
            if c.is_alphabetic() {
                break i;
            }
        };
        for (i, c) in self.chars.by_ref() {
            if !c.is_alphabetic() {
                return Some(&self.text[start..i]);
            }
        }
        Some(&self.text[start..])
    }
}

/// Same counts as `WC`, tokenized with a `\p{Alphabetic}+` regex. Roughly an
/// order of magnitude slower.
pub struct RegexWC {
    word: Regex,
}

impl RegexWC {
    pub fn new() -> Result<Self, anyhow::Error> {
        Ok(RegexWC { word: Regex::new(r"\p{Alphabetic}+")? })
    }
}

impl MapFunction for RegexWC {
    fn map<'a>(&'a self, doc: &'a Document) -> Pairs<'a> {
        Box::new(self.word.find_iter(doc.text()).map(|m| Ok::<_, anyhow::Error>(KeyValue::new(m.as_str(), 1))))
    }
}

impl ReduceFunction for RegexWC {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        SumReducer.reduce(acc, kv)
    }
}
