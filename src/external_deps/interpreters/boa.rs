use boa_engine::{Context, Source};

use super::{InterpreterError, InterpreterResult, JavascriptInterpreter};

/// Default interpreter backed by the Boa JavaScript engine.
///
/// A fresh [`Context`] is built per evaluation so challenge scripts never
/// observe state from earlier pages.
#[derive(Debug, Default)]
pub struct BoaJavascriptInterpreter;

impl BoaJavascriptInterpreter {
    pub fn new() -> Self {
        Self
    }

    fn build_prelude(&self, host: &str) -> String {
        format!(
            r#"
var __host = "{host}";
var location = {{
    href: "https://" + __host + "/",
    hostname: __host,
    protocol: "https:",
    port: ""
}};
var window = {{ location: location }};
var navigator = {{
    userAgent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
    language: "en-US",
    languages: ["en-US", "en"],
    platform: "Win32"
}};
window.navigator = navigator;
var performance = {{ now: function() {{ return Date.now(); }} }};
window.performance = performance;
var __noopElement = {{
    value: "",
    style: {{}},
    setAttribute: function() {{}},
    getAttribute: function() {{ return ""; }},
    addEventListener: function() {{}},
    appendChild: function(child) {{ return child; }},
    submit: function() {{}}
}};
var document = {{
    location: location,
    createElement: function() {{ return __noopElement; }},
    getElementById: function() {{ return __noopElement; }},
    querySelector: function() {{ return __noopElement; }},
    querySelectorAll: function() {{ return []; }},
    addEventListener: function() {{}}
}};
window.document = document;
function setTimeout(cb, delay) {{ return cb(); }}
function clearTimeout() {{}}
"#,
            host = host
        )
    }

}

impl JavascriptInterpreter for BoaJavascriptInterpreter {
    fn solve_expression(&self, expression: &str, host: &str) -> InterpreterResult<String> {
        if expression.trim().is_empty() {
            return Err(InterpreterError::Execution(
                "challenge expression is empty".into(),
            ));
        }

        let mut context = Context::default();
        let prelude = self.build_prelude(host);
        context
            .eval(Source::from_bytes(&prelude))
            .map_err(|err| InterpreterError::Other(err.to_string()))?;

        let answer = context
            .eval(Source::from_bytes(expression))
            .map_err(|err| InterpreterError::Execution(err.to_string()))?;

        if answer.is_null() || answer.is_undefined() {
            return Err(InterpreterError::Execution(
                "challenge expression produced no value".into(),
            ));
        }

        if let Ok(number) = answer.to_number(&mut context)
            && number.is_finite()
        {
            return Ok(format!("{number:.10}"));
        }

        let text = answer
            .to_string(&mut context)
            .map_err(|err| InterpreterError::Execution(err.to_string()))?
            .to_std_string()
            .map_err(|_| InterpreterError::Other("unable to convert interpreter output".into()))?;

        Ok(text)
    }

    fn execute(&self, script: &str, host: &str) -> InterpreterResult<String> {
        let mut context = Context::default();
        let prelude = self.build_prelude(host);

        context
            .eval(Source::from_bytes(&prelude))
            .map_err(|err| InterpreterError::Other(err.to_string()))?;

        let value = context
            .eval(Source::from_bytes(script))
            .map_err(|err| InterpreterError::Execution(err.to_string()))?;

        let text = value
            .to_string(&mut context)
            .map_err(|err| InterpreterError::Execution(err.to_string()))?
            .to_std_string()
            .map_err(|_| InterpreterError::Other("unable to convert interpreter output".into()))?;

        Ok(text)
    }
}
