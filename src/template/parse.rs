//! Compact textual form of shard templates.
//!
//! ```text
//! template := node ("->" children)?
//! children := "(" template ("," template)* ")" | template
//! node     := WORD ("(" arg ("," arg)* ")")?
//! ```
//!
//! Concrete nodes take `host[,weight[,source[,dest]]]`. Virtual nodes take either
//! `weight` or `host,weight[,source[,dest]]` where the host is ignored.

use super::{ShardTemplate, VirtualKind, DEFAULT_WEIGHT};
use crate::config::TemplateOptions;
use crate::error::{Error, Result};
use logos::{Lexer, Logos};

#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"[ \t\n\r]+")]
enum Token {
    /// Type name, host, weight or column type.
    #[regex(r"[A-Za-z0-9_.:$]+", word)]
    Word(String),
    #[token("->")]
    Arrow,
    #[token("(")]
    Open,
    #[token(")")]
    Close,
    #[token(",")]
    Comma,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '$')
}

/// Extend a word over inner hyphens (`db-1`), stopping before an arrow.
fn word(lex: &mut Lexer<Token>) -> String {
    loop {
        let rest = lex.remainder();
        let mut chars = rest.chars();
        match (chars.next(), chars.next()) {
            (Some('-'), Some(c)) if is_word_char(c) => {}
            _ => break,
        }
        let len = rest[1..]
            .find(|c: char| !is_word_char(c))
            .map_or(rest.len(), |i| i + 1);
        lex.bump(len);
    }
    lex.slice().to_string()
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut lexer = Token::lexer(text);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next() {
        match token {
            Ok(token) => tokens.push(token),
            Err(()) => {
                return Err(Error::MalformedTemplate(format!(
                    "unexpected {:?} at offset {}",
                    lexer.slice(),
                    lexer.span().start
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    options: &'a TemplateOptions,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn template(&mut self) -> Result<ShardTemplate> {
        let (word, args) = self.node()?;
        let children = if self.peek() == Some(&Token::Arrow) {
            self.pos += 1;
            self.children()?
        } else {
            Vec::new()
        };
        self.build(word, args, children)
    }

    fn children(&mut self) -> Result<Vec<ShardTemplate>> {
        if self.peek() != Some(&Token::Open) {
            return Ok(vec![self.template()?]);
        }
        self.pos += 1;
        let mut children = vec![self.template()?];
        loop {
            match self.next() {
                Some(Token::Comma) => children.push(self.template()?),
                Some(Token::Close) => return Ok(children),
                other => {
                    return Err(Error::MalformedTemplate(format!(
                        "expected ',' or ')' in child list, found {:?}",
                        other
                    )))
                }
            }
        }
    }

    fn node(&mut self) -> Result<(String, Option<Vec<String>>)> {
        let word = match self.next() {
            Some(Token::Word(w)) => w,
            other => {
                return Err(Error::MalformedTemplate(format!(
                    "expected shard type, found {:?}",
                    other
                )))
            }
        };

        if self.peek() != Some(&Token::Open) {
            return Ok((word, None));
        }
        self.pos += 1;

        // Empty arguments are allowed, e.g. `Type(,1,src,dst)`.
        let mut args = vec![String::new()];
        loop {
            match self.next() {
                Some(Token::Word(w)) => {
                    let last = args.len() - 1;
                    if !args[last].is_empty() {
                        return Err(Error::MalformedTemplate(format!(
                            "missing ',' before {:?}",
                            w
                        )));
                    }
                    args[last] = w;
                }
                Some(Token::Comma) => args.push(String::new()),
                Some(Token::Close) => break,
                other => {
                    return Err(Error::MalformedTemplate(format!(
                        "malformed argument list for {}: {:?}",
                        word, other
                    )))
                }
            }
        }
        Ok((word, Some(args)))
    }

    fn build(
        &self,
        word: String,
        args: Option<Vec<String>>,
        children: Vec<ShardTemplate>,
    ) -> Result<ShardTemplate> {
        if VirtualKind::from_class_name(&word).is_some() {
            let args = args.unwrap_or_default();
            let (weight, source, dest) = match args.len() {
                0 => (DEFAULT_WEIGHT, "", ""),
                1 => (parse_weight(&args[0])?, "", ""),
                2..=4 => (
                    parse_weight(&args[1])?,
                    args.get(2).map(String::as_str).unwrap_or(""),
                    args.get(3).map(String::as_str).unwrap_or(""),
                ),
                n => {
                    return Err(Error::MalformedTemplate(format!(
                        "{} takes at most 4 arguments, got {}",
                        word, n
                    )))
                }
            };
            return ShardTemplate::new(word, "", weight, source, dest, children);
        }

        match args {
            Some(args) => {
                self.check_known(&word)?;
                if args.len() > 4 {
                    return Err(Error::MalformedTemplate(format!(
                        "{} takes at most 4 arguments, got {}",
                        word,
                        args.len()
                    )));
                }
                let weight = match args.get(1) {
                    Some(w) => parse_weight(w)?,
                    None => DEFAULT_WEIGHT,
                };
                ShardTemplate::new(
                    word,
                    args[0].clone(),
                    weight,
                    args.get(2).cloned().unwrap_or_default(),
                    args.get(3).cloned().unwrap_or_default(),
                    children,
                )
            }
            None if self.options.simple => ShardTemplate::new(
                self.options.default_concrete_type.clone(),
                word,
                DEFAULT_WEIGHT,
                self.options.source_type.clone(),
                self.options.dest_type.clone(),
                children,
            ),
            None => Err(Error::MalformedTemplate(format!(
                "{} is not a virtual shard type and has no host",
                word
            ))),
        }
    }

    fn check_known(&self, shard_type: &str) -> Result<()> {
        let known = &self.options.known_concrete_types;
        if known.is_empty()
            || known.contains(shard_type)
            || known.contains(super::short_type(shard_type))
        {
            Ok(())
        } else {
            Err(Error::MalformedTemplate(format!(
                "unknown shard type {:?}",
                shard_type
            )))
        }
    }
}

fn parse_weight(arg: &str) -> Result<u32> {
    if arg.is_empty() {
        return Ok(DEFAULT_WEIGHT);
    }
    arg.parse()
        .map_err(|_| Error::MalformedTemplate(format!("invalid weight {:?}", arg)))
}

pub(super) fn parse(text: &str, options: &TemplateOptions) -> Result<ShardTemplate> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(Error::MalformedTemplate("empty template".to_string()));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        options,
    };
    let template = parser.template()?;
    if let Some(extra) = parser.peek() {
        return Err(Error::MalformedTemplate(format!(
            "unexpected trailing token {:?}",
            extra
        )));
    }
    Ok(template)
}

pub(super) fn format(t: &ShardTemplate) -> String {
    let typed = !t.source_type.is_empty() || !t.dest_type.is_empty();
    let mut out = match (t.is_concrete(), typed) {
        (true, false) => format!("{}({},{})", t.shard_type, t.host, t.weight),
        (true, true) => format!(
            "{}({},{},{},{})",
            t.shard_type, t.host, t.weight, t.source_type, t.dest_type
        ),
        (false, false) => format!("{}({})", t.shard_type, t.weight),
        (false, true) => format!(
            "{}(,{},{},{})",
            t.shard_type, t.weight, t.source_type, t.dest_type
        ),
    };

    match t.children.as_slice() {
        [] => {}
        [only] => {
            out.push_str(" -> ");
            out.push_str(&format(only));
        }
        many => {
            let inner: Vec<String> = many.iter().map(format).collect();
            out.push_str(" -> (");
            out.push_str(&inner.join(", "));
            out.push(')');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> TemplateOptions {
        TemplateOptions::default()
    }

    #[test]
    fn test_parse_concrete() {
        let t = parse("SqlShard(db1,3,INT UNSIGNED,INT)", &opts());
        assert!(t.is_err(), "spaces split words");

        let t = parse("SqlShard(db1,3,INT,BIGINT)", &opts()).unwrap();
        assert_eq!(t.host(), "db1");
        assert_eq!(t.weight(), 3);
        assert_eq!(t.source_type(), "INT");
        assert_eq!(t.dest_type(), "BIGINT");

        let t = parse("SqlShard(db-1.example.com:3306)", &opts()).unwrap();
        assert_eq!(t.host(), "db-1.example.com:3306");
        assert_eq!(t.weight(), DEFAULT_WEIGHT);
    }

    #[test]
    fn test_parse_nested() {
        let t = parse(
            "ReplicatingShard -> (SqlShard(db1,1), BlockedShard(2) -> SqlShard(db2,2))",
            &opts(),
        )
        .unwrap();
        assert_eq!(t.children().len(), 2);
        // heavier child sorts first
        assert_eq!(t.children()[0].short_type(), "BlockedShard");
        assert_eq!(t.children()[0].host(), "db2");
        assert_eq!(t.descendants().len(), 4);
    }

    #[test]
    fn test_parse_virtual_args() {
        let t = parse("ReplicatingShard(,2,INT,INT) -> SqlShard(db1)", &opts()).unwrap();
        assert_eq!(t.weight(), 2);
        assert_eq!(t.source_type(), "INT");
        assert_eq!(t.host(), "db1");

        let t = parse("ReplicatingShard(5) -> SqlShard(db1)", &opts()).unwrap();
        assert_eq!(t.weight(), 5);
    }

    #[test]
    fn test_simple_mode() {
        let options = TemplateOptions::default()
            .with_simple(true)
            .with_default_concrete_type("MySqlShard");
        let t = parse("ReplicatingShard -> (db1, db2)", &options).unwrap();
        let types: Vec<_> = t.concrete_descendants().iter().map(|c| c.shard_type()).collect();
        assert_eq!(types, vec!["MySqlShard", "MySqlShard"]);

        assert!(matches!(
            parse("ReplicatingShard -> (db1, db2)", &opts()),
            Err(Error::MalformedTemplate(_))
        ));
    }

    #[test]
    fn test_whitelist() {
        let options = TemplateOptions::default().with_known_concrete_type("SqlShard");
        assert!(parse("SqlShard(db1)", &options).is_ok());
        assert!(parse("com.example.SqlShard(db1)", &options).is_ok());
        assert!(matches!(
            parse("RedisShard(db1)", &options),
            Err(Error::MalformedTemplate(_))
        ));
    }

    #[test]
    fn test_malformed() {
        for text in [
            "",
            "SqlShard(db1",
            "SqlShard(db1,x)",
            "SqlShard(db1 db2)",
            "SqlShard(db1,1,a,b,c)",
            "ReplicatingShard",
            "ReplicatingShard -> (SqlShard(db1),)",
            "SqlShard(db1) -> SqlShard(db2)",
            "SqlShard(db1) SqlShard(db2)",
            "SqlShard(db1) -> ",
            "Sql#Shard(db1)",
        ] {
            assert!(
                matches!(parse(text, &opts()), Err(Error::MalformedTemplate(_))),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Blocked-Shard -> (SqlShard(db-1,2), x)").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("Blocked-Shard".to_string()),
                Token::Arrow,
                Token::Open,
                Token::Word("SqlShard".to_string()),
                Token::Open,
                Token::Word("db-1".to_string()),
                Token::Comma,
                Token::Word("2".to_string()),
                Token::Close,
                Token::Comma,
                Token::Word("x".to_string()),
                Token::Close,
            ]
        );

        // No whitespace needed around the arrow.
        let tokens = tokenize("a->b").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("a".to_string()),
                Token::Arrow,
                Token::Word("b".to_string())
            ]
        );

        assert!(matches!(
            tokenize("SqlShard(db1) # note"),
            Err(Error::MalformedTemplate(m)) if m.contains("offset 14")
        ));
    }

    #[test]
    fn test_format_parses_back() {
        let text = "ReplicatingShard(1) -> (SqlShard(db2,2), SqlShard(db1,1,INT,INT))";
        let t = parse(text, &opts()).unwrap();
        assert_eq!(t.to_string(), text);
        assert_eq!(parse(&t.to_string(), &opts()).unwrap(), t);
    }
}
