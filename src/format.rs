/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # The command formatter
//!
//! A command on the wire is an array of bulk strings: `*N\r\n` followed by
//! `$len\r\n<bytes>\r\n` for each argument (§4.3). [`CommandBuilder`] builds
//! this up one argument at a time, in the same three-section-buffer style
//! the store's own query builder uses, just with a single combined buffer
//! since there is no separate metaline/metalayout/dataframe split in this
//! wire format.

use crate::error::Error;

/// Incrementally builds one command's wire bytes.
///
/// Arguments are accumulated into a side buffer so the leading `*N\r\n`
/// count can be written once the final argument count is known; finishing
/// the builder concatenates the count header with the accumulated bytes.
#[derive(Debug, Default)]
pub struct CommandBuilder {
    argc: usize,
    body: Vec<u8>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self {
            argc: 0,
            body: Vec::with_capacity(128),
        }
    }

    /// Append one argument, encoded as a bulk string.
    pub fn arg(&mut self, arg: impl AsRef<[u8]>) -> &mut Self {
        let arg = arg.as_ref();
        self.body.push(b'$');
        self.body.extend(arg.len().to_string().as_bytes());
        self.body.extend(b"\r\n");
        self.body.extend(arg);
        self.body.extend(b"\r\n");
        self.argc += 1;
        self
    }

    /// Append every argument from an iterator.
    pub fn args<I, A>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        for a in args {
            self.arg(a);
        }
        self
    }

    /// Finish and return the complete command bytes.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 16);
        out.push(b'*');
        out.extend(self.argc.to_string().as_bytes());
        out.extend(b"\r\n");
        out.extend(self.body);
        out
    }
}

/// Build a command from an explicit argument vector (§4.3, "explicit array
/// form").
pub fn format_argv<I, A>(args: I) -> Vec<u8>
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let mut b = CommandBuilder::new();
    b.args(args);
    b.finish()
}

/// One interpolated value for [`format_template`].
#[derive(Debug, Clone)]
pub enum TemplateArg<'a> {
    /// `%s` — any byte string, interpolated as-is (binary-safe on this side;
    /// unlike the original C API this is never NUL-delimited).
    Str(&'a str),
    /// `%b` — an explicit pointer+length pair, binary-safe.
    Bytes(&'a [u8]),
    /// `%d` — a signed integer, formatted in decimal.
    Int(i64),
    /// `%f` — a floating-point value, formatted with `{}`'s default `Display`.
    Float(f64),
}

/// Build a command from a printf-style template (§4.3).
///
/// The template is split on ASCII whitespace into tokens; each token may
/// contain at most one directive (`%s`, `%b`, `%d`, `%f`, or the literal
/// `%%`), consuming one [`TemplateArg`] per directive other than `%%`.
/// Directive order in `args` must match the order directives appear when
/// scanning the template left to right. A malformed or unknown directive,
/// or an argument-count mismatch, is a [`Error::other`] — this mirrors the
/// reference implementation's "negative length" return for template errors.
pub fn format_template(template: &str, args: &[TemplateArg<'_>]) -> Result<Vec<u8>, Error> {
    let mut builder = CommandBuilder::new();
    let mut args = args.iter();
    for token in template.split_ascii_whitespace() {
        let rendered = render_token(token, &mut args)?;
        builder.arg(rendered);
    }
    if args.next().is_some() {
        return Err(Error::other("more template arguments supplied than directives"));
    }
    Ok(builder.finish())
}

fn render_token<'a, I>(token: &str, args: &mut I) -> Result<Vec<u8>, Error>
where
    I: Iterator<Item = &'a TemplateArg<'a>>,
{
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let Some(&directive) = bytes.get(i + 1) else {
            return Err(Error::other("dangling '%' at end of template token"));
        };
        i += 2;
        match directive {
            b'%' => out.push(b'%'),
            b's' => match args.next() {
                Some(TemplateArg::Str(s)) => out.extend(s.as_bytes()),
                Some(_) => return Err(Error::other("%s requires a Str argument")),
                None => return Err(Error::other("missing argument for %s")),
            },
            b'b' => match args.next() {
                Some(TemplateArg::Bytes(b)) => out.extend(*b),
                Some(_) => return Err(Error::other("%b requires a Bytes argument")),
                None => return Err(Error::other("missing argument for %b")),
            },
            b'd' => match args.next() {
                Some(TemplateArg::Int(v)) => out.extend(v.to_string().as_bytes()),
                Some(_) => return Err(Error::other("%d requires an Int argument")),
                None => return Err(Error::other("missing argument for %d")),
            },
            b'f' => match args.next() {
                Some(TemplateArg::Float(v)) => out.extend(v.to_string().as_bytes()),
                Some(_) => return Err(Error::other("%f requires a Float argument")),
                None => return Err(Error::other("missing argument for %f")),
            },
            other => {
                return Err(Error::other(format!(
                    "unknown template directive '%{}'",
                    other as char
                )))
            }
        }
    }
    Ok(out)
}
