// =============================================================================
// Title normalization for cross-venue market matching
// =============================================================================
//
// Venues title the same event differently ("Man Utd vs. Chelsea!", "MAN UTD @
// CHELSEA — EPL"). Normalization maps both onto one canonical string so the
// feature extractor sees identical input.
//
// Pipeline: lowercase → strip punctuation (keeping the team-delimiter tokens
// and the characters numeric thresholds need) → expand known abbreviations →
// collapse whitespace.
// =============================================================================

use std::collections::HashMap;

use lazy_static::lazy_static;

lazy_static! {
    /// Bounded alias table: team abbreviations, league and org acronyms,
    /// crypto tickers, month names. Keys and values are lowercase.
    static ref ALIASES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        // Teams
        m.insert("man utd", "manchester united");
        m.insert("man united", "manchester united");
        m.insert("man city", "manchester city");
        m.insert("psg", "paris saint germain");
        m.insert("juve", "juventus");
        m.insert("spurs", "tottenham hotspur");
        m.insert("wolves", "wolverhampton wanderers");
        m.insert("lal", "los angeles lakers");
        m.insert("gsw", "golden state warriors");
        m.insert("nyy", "new york yankees");
        m.insert("niners", "san francisco 49ers");
        m.insert("bucs", "tampa bay buccaneers");
        m.insert("pats", "new england patriots");
        // Leagues / orgs
        m.insert("epl", "premier league");
        m.insert("ucl", "champions league");
        m.insert("fed", "federal reserve");
        m.insert("ecb", "european central bank");
        m.insert("boe", "bank of england");
        m.insert("opec", "organization of the petroleum exporting countries");
        m.insert("sec", "securities and exchange commission");
        // Crypto tickers
        m.insert("btc", "bitcoin");
        m.insert("eth", "ethereum");
        m.insert("sol", "solana");
        m.insert("xrp", "ripple");
        m.insert("doge", "dogecoin");
        m.insert("ada", "cardano");
        // Month names
        m.insert("jan", "january");
        m.insert("feb", "february");
        m.insert("mar", "march");
        m.insert("apr", "april");
        m.insert("jun", "june");
        m.insert("jul", "july");
        m.insert("aug", "august");
        m.insert("sep", "september");
        m.insert("sept", "september");
        m.insert("oct", "october");
        m.insert("nov", "november");
        m.insert("dec", "december");
        m
    };
}

/// Normalize a raw venue title into canonical matching form.
pub fn normalize_title(raw: &str) -> String {
    let lowered = raw.to_lowercase();

    // Strip punctuation. '@' survives as a team delimiter; '.', '/', '-',
    // '$', '%', '°' survive because thresholds and dates ("2025-03-01",
    // "3/1", "$70k", "70°") need them.
    let mut cleaned = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        match ch {
            'a'..='z' | '0'..='9' | ' ' | '@' | '.' | '/' | '-' | '$' | '%' | '°' => {
                cleaned.push(ch)
            }
            '_' | ':' => cleaned.push(' '),
            _ => {}
        }
    }

    // Token-wise alias expansion, longest (two-word) aliases first so
    // "man utd" wins over any single-token rule.
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let mut expanded: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if i + 1 < tokens.len() {
            let pair = format!("{} {}", tokens[i], tokens[i + 1]);
            if let Some(alias) = ALIASES.get(pair.as_str()) {
                expanded.push((*alias).to_string());
                i += 2;
                continue;
            }
        }
        // Trailing "vs." already lost its dot above; strip a leftover dot so
        // "vs." and "vs" compare equal.
        let token = tokens[i].trim_end_matches('.');
        match ALIASES.get(token) {
            Some(alias) => expanded.push((*alias).to_string()),
            None => expanded.push(token.to_string()),
        }
        i += 1;
    }

    expanded.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_punctuation() {
        assert_eq!(
            normalize_title("Will Bitcoin close ABOVE $70,000?!"),
            "will bitcoin close above $70000"
        );
    }

    #[test]
    fn keeps_team_delimiters() {
        assert_eq!(
            normalize_title("Celtics vs. Knicks"),
            "celtics vs knicks"
        );
        assert_eq!(
            normalize_title("LAL @ GSW"),
            "los angeles lakers @ golden state warriors"
        );
    }

    #[test]
    fn expands_two_word_aliases_first() {
        assert_eq!(
            normalize_title("Man Utd vs Man City"),
            "manchester united vs manchester city"
        );
    }

    #[test]
    fn expands_tickers_and_months() {
        assert_eq!(
            normalize_title("BTC above 70K on Mar 1"),
            "bitcoin above 70k on march 1"
        );
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(normalize_title("  ETH   —  above\t$4K "), "ethereum above $4k");
    }

    #[test]
    fn idempotent_on_normalized_input() {
        let once = normalize_title("Spurs vs Wolves, Dec 12");
        let twice = normalize_title(&once);
        assert_eq!(once, twice);
    }
}
