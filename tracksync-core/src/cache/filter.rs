use std::collections::BTreeSet;

/// Label and library ignore lists, applied whenever a node enters the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreFilter {
    labels: BTreeSet<String>,
    libraries: BTreeSet<String>,
}

impl IgnoreFilter {
    pub fn new<L, B>(labels: L, libraries: B) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            labels: normalize(labels),
            libraries: normalize(libraries),
        }
    }

    /// Library sections are matched by display name.
    pub fn library_ignored(&self, name: &str) -> bool {
        self.libraries.contains(name.trim())
    }

    pub fn show_ignored<'a, I>(&self, labels: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        labels
            .into_iter()
            .any(|label| self.labels.contains(label.trim()))
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.libraries.is_empty()
    }
}

fn normalize<I>(values: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    values
        .into_iter()
        .map(Into::into)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}
