/// Strips trailing whitespace and statement terminators.
pub fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_terminators() {
        assert_eq!(trim_statement("  select 1 ;\n ; "), "select 1");
        assert_eq!(trim_statement("select 1"), "select 1");
    }
}
