use serde::{Deserialize, Deserializer};

/// List-valued options arrive two ways: toml gives a real array, env vars
/// and cli flags give one comma-joined string. Accept both.
pub fn deserialize_vec_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Joined(joined) => joined
            .split(',')
            .map(|part| part.trim().to_string())
            .collect(),
        OneOrMany::List(list) => list,
    })
}
