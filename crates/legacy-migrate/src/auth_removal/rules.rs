//! Text rewrites that strip authentication from source files.
//!
//! Every rule takes the file content and returns the rewritten content
//! together with the components it removed. A rule that finds nothing
//! returns the content unchanged and an empty list.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrateError, Result};

/// One removal pattern with the component it stands for.
struct Rule {
    component: &'static str,
    pattern: &'static str,
}

const PROGRAM_RULES: &[Rule] = &[
    Rule {
        component: "JWT Authentication Configuration",
        pattern: r"(?is)(//[^\n]*jwt[^\n]*\n)?[ \t]*builder\.Services\.AddAuthentication\(.*?\.AddJwtBearer\(.*?\n\s*\}\);[ \t]*\r?\n?",
    },
    Rule {
        component: "Authentication Middleware",
        pattern: r"(?m)^[ \t]*app\.UseAuthentication\(\);[ \t]*\r?\n?",
    },
    Rule {
        component: "Authorization Middleware",
        pattern: r"(?m)^[ \t]*app\.UseAuthorization\(\);[ \t]*\r?\n?",
    },
    Rule {
        component: "Authorization Services",
        pattern: r"(?m)^[ \t]*builder\.Services\.AddAuthorization\([^;]*\);[ \t]*\r?\n?",
    },
    Rule {
        component: "Authentication Service Registrations",
        pattern: r"(?m)^[ \t]*builder\.Services\.AddScoped<I(Authentication|Authorization)Service,\s*\w+>\(\);[ \t]*\r?\n?",
    },
    Rule {
        component: "Authentication Endpoints",
        pattern: r"(?m)^[ \t]*app\.MapAuthenticationEndpoints\(\);[ \t]*\r?\n?",
    },
    Rule {
        component: "JWT Using Directives",
        pattern: r"(?m)^[ \t]*using (Microsoft\.AspNetCore\.Authentication\.JwtBearer|Microsoft\.IdentityModel\.Tokens|System\.IdentityModel\.Tokens\.Jwt);[ \t]*\r?\n?",
    },
];

const AUTHORIZE_RULES: &[Rule] = &[
    Rule {
        component: "Authorize Attributes",
        pattern: r"(?m)^[ \t]*\[(Authorize|AllowAnonymous)(\([^\]]*\))?\][ \t]*\r?\n",
    },
];

const AUTHORIZATION_USING: &[Rule] = &[
    Rule {
        component: "Authorization Using Directive",
        pattern: r"(?m)^[ \t]*using Microsoft\.AspNetCore\.Authorization;[ \t]*\r?\n?",
    },
];

const ROUTE_RULES: &[Rule] = &[
    Rule {
        component: "Route Guards",
        pattern: r"(?m)^[ \t]*canActivate(Child)?\s*:\s*\[[^\]]*\],?[ \t]*\r?\n",
    },
    Rule {
        component: "Guard Imports",
        pattern: r#"(?m)^[ \t]*import\s*\{[^}]*\}\s*from\s*['"][^'"]*guard[^'"]*['"];?[ \t]*\r?\n"#,
    },
];

fn compiled(rules: &'static [Rule], cache: &'static OnceLock<Vec<(Regex, &'static str)>>) -> &'static [(Regex, &'static str)] {
    cache.get_or_init(|| {
        rules
            .iter()
            .filter_map(|r| Regex::new(r.pattern).ok().map(|re| (re, r.component)))
            .collect()
    })
}

fn apply(content: &str, rules: &[(Regex, &'static str)]) -> (String, Vec<String>) {
    let mut text = content.to_string();
    let mut removed = Vec::new();
    for (re, component) in rules {
        if re.is_match(&text) {
            text = re.replace_all(&text, "").into_owned();
            removed.push(component.to_string());
        }
    }
    if removed.is_empty() {
        return (text, removed);
    }
    (collapse_blank_lines(&text), removed)
}

fn collapse_blank_lines(text: &str) -> String {
    static BLANKS: OnceLock<Option<Regex>> = OnceLock::new();
    match BLANKS.get_or_init(|| Regex::new(r"\n[ \t]*\r?\n([ \t]*\r?\n)+").ok()) {
        Some(re) => re.replace_all(text, "\n\n").into_owned(),
        None => text.to_string(),
    }
}

/// Strip authentication wiring from the API entry point.
pub fn strip_program(content: &str) -> (String, Vec<String>) {
    static CACHE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    apply(content, compiled(PROGRAM_RULES, &CACHE))
}

/// Strip `[Authorize]` attributes from an API source file.
pub fn strip_authorize(content: &str) -> (String, Vec<String>) {
    static CACHE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let (text, mut removed) = apply(content, compiled(AUTHORIZE_RULES, &CACHE));
    if removed.is_empty() {
        return (text, removed);
    }
    // The using directive only goes once no attribute needs it.
    static USING: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let (text, mut more) = apply(&text, compiled(AUTHORIZATION_USING, &USING));
    removed.append(&mut more);
    (text, removed)
}

/// Strip `canActivate` guards and guard imports from a route file.
pub fn strip_route_guards(content: &str) -> (String, Vec<String>) {
    static CACHE: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    apply(content, compiled(ROUTE_RULES, &CACHE))
}

/// Whether an API source file carries authorization attributes.
pub fn has_authorize(content: &str) -> bool {
    content.lines().any(|l| {
        let l = l.trim_start();
        l.starts_with("[Authorize") || l.starts_with("[AllowAnonymous")
    })
}

/// Whether a route file references guards.
pub fn has_route_guards(content: &str) -> bool {
    content.contains("canActivate")
}

/// Whether an interceptor attaches bearer credentials.
pub fn attaches_bearer(content: &str) -> bool {
    content.contains("Bearer") || content.contains("Authorization")
}

/// Remove a top-level key from a JSON settings file.
///
/// Returns `None` when the key is absent. Key order is kept.
pub fn remove_json_key(content: &str, key: &str) -> Result<Option<String>> {
    let mut value: Value = serde_json::from_str(content)?;
    let Some(object) = value.as_object_mut() else {
        return Err(MigrateError::Validation("settings file is not a JSON object".into()));
    };
    if object.shift_remove(key).is_none() {
        return Ok(None);
    }
    let mut text = serde_json::to_string_pretty(&value)?;
    if content.ends_with('\n') {
        text.push('\n');
    }
    Ok(Some(text))
}

/// Kind of frontend file replaced with a pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeutralizeKind {
    Guard,
    Interceptor,
}

/// Replace a guard or interceptor with a pass-through that keeps its
/// exported names, so importers still compile.
pub fn neutralize(content: &str, kind: NeutralizeKind) -> (String, Vec<String>) {
    static EXPORTS: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = EXPORTS.get_or_init(|| Regex::new(r"(?m)^export\s+(const|class)\s+(\w+)").ok()) else {
        return (content.to_string(), Vec::new());
    };

    let exports: Vec<(bool, String)> = re
        .captures_iter(content)
        .map(|c| (&c[1] == "class", c[2].to_string()))
        .collect();
    if exports.is_empty() {
        return (content.to_string(), Vec::new());
    }

    let mut out = String::from("// Authentication removed during migration: pass-through replacement.\n");
    match kind {
        NeutralizeKind::Guard => {
            let classes = exports.iter().any(|(class, _)| *class);
            if classes {
                out.push_str("import { Injectable } from '@angular/core';\n");
            }
            if exports.iter().any(|(class, _)| !class) {
                out.push_str("import { CanActivateFn } from '@angular/router';\n");
            }
            out.push('\n');
            for (class, name) in &exports {
                if *class {
                    out.push_str(&format!(
                        "@Injectable({{ providedIn: 'root' }})\nexport class {} {{\n  canActivate(): boolean {{\n    return true;\n  }}\n}}\n\n",
                        name
                    ));
                } else {
                    out.push_str(&format!("export const {}: CanActivateFn = () => true;\n\n", name));
                }
            }
        }
        NeutralizeKind::Interceptor => {
            let classes = exports.iter().any(|(class, _)| *class);
            if classes {
                out.push_str("import { Injectable } from '@angular/core';\n");
                out.push_str("import { HttpEvent, HttpHandler, HttpInterceptor, HttpRequest } from '@angular/common/http';\n");
                out.push_str("import { Observable } from 'rxjs';\n");
            }
            if exports.iter().any(|(class, _)| !class) {
                out.push_str("import { HttpInterceptorFn } from '@angular/common/http';\n");
            }
            out.push('\n');
            for (class, name) in &exports {
                if *class {
                    out.push_str(&format!(
                        "@Injectable()\nexport class {} implements HttpInterceptor {{\n  intercept(req: HttpRequest<unknown>, next: HttpHandler): Observable<HttpEvent<unknown>> {{\n    return next.handle(req);\n  }}\n}}\n\n",
                        name
                    ));
                } else {
                    out.push_str(&format!(
                        "export const {}: HttpInterceptorFn = (req, next) => next(req);\n\n",
                        name
                    ));
                }
            }
        }
    }
    let component = match kind {
        NeutralizeKind::Guard => "Authentication Guard",
        NeutralizeKind::Interceptor => "Bearer Token Interceptor",
    };
    let names: Vec<String> = exports
        .iter()
        .map(|(_, name)| format!("{} ({})", component, name))
        .collect();
    (out.trim_end().to_string() + "\n", names)
}
