use std::sync::Arc;

use anyhow::{Context, Result};
use headless_chrome::Tab;
use job_form_agent::types::PageSnapshot;

/// JavaScript injected into the page to describe its form fields.
/// NON-DESTRUCTIVE apart from tagging each field with a `data-eid` attribute.
///
/// The script:
///   1. Walks every visible input, textarea and select (hidden and submit inputs excluded).
///   2. Gives each a stable `data-eid` so it can be addressed as `[data-eid="fN"]`.
///      Radios sharing a `name` become one field, tagged on the first radio, whose
///      options are the radios' labels.
///   3. Resolves its label from `<label for>`, a wrapping label or aria-label.
///   4. Collects up to three short text snippets from the surrounding container.
///   5. Finds the most likely submit control.
///   6. Returns the whole snapshot as a JSON string.
const SNAPSHOT_JS: &str = r#"
(() => {
  const KEEP_ATTRS = ['id','name','type','maxlength','pattern','autocomplete','aria-label',
                      'data-assessment','data-test','data-quiz','data-automation-id'];
  let next = 0;
  document.querySelectorAll('[data-eid]').forEach(el => {
    const n = parseInt((el.getAttribute('data-eid') || '').slice(1), 10);
    if (!isNaN(n) && n >= next) next = n + 1;
  });

  function isVisible(el) {
    if (el.offsetParent === null && el.type !== 'file') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden';
  }

  function selectorFor(el, prefix) {
    let eid = el.getAttribute('data-eid');
    if (!eid) {
      eid = prefix + (next++);
      el.setAttribute('data-eid', eid);
    }
    return '[data-eid="' + eid + '"]';
  }

  function labelFor(el) {
    if (el.id) {
      const l = document.querySelector('label[for="' + CSS.escape(el.id) + '"]');
      if (l) return l.innerText.trim();
    }
    const wrap = el.closest('label');
    if (wrap) return wrap.innerText.trim();
    return el.getAttribute('aria-label') || '';
  }

  function optionText(radio) {
    const l = radio.labels && radio.labels[0];
    return ((l && l.innerText) || radio.value || '').trim();
  }

  function groupLabel(radio) {
    const legend = radio.closest('fieldset')?.querySelector('legend');
    if (legend) return legend.innerText.trim();
    const group = radio.closest('[role=radiogroup]');
    if (group) return group.getAttribute('aria-label') || '';
    return '';
  }

  function nearby(el) {
    const box = el.closest('div, fieldset, li, section') || el.parentElement;
    if (!box) return [];
    const out = [];
    for (const node of box.querySelectorAll('p, span, legend, small, div')) {
      if (node.children.length > 0) continue;
      const t = (node.textContent || '').trim();
      if (t.length > 2 && t.length < 200 && !out.includes(t)) out.push(t);
      if (out.length >= 3) break;
    }
    return out;
  }

  const fields = [];
  const radioGroups = new Map();
  for (const el of document.querySelectorAll('input, textarea, select')) {
    const type = (el.getAttribute('type') || (el.tagName === 'INPUT' ? 'text' : '')).toLowerCase();
    if (['hidden','submit','button','reset','image'].includes(type)) continue;
    if (!isVisible(el)) continue;
    const grouped = type === 'radio' && el.name;
    if (grouped && radioGroups.has(el.name)) {
      const group = radioGroups.get(el.name);
      group.options.push(optionText(el));
      if (el.checked) group.currentValue = optionText(el);
      group.required = group.required || el.required;
      continue;
    }
    const attributes = {};
    for (const name of KEEP_ATTRS) {
      const v = el.getAttribute(name);
      if (v !== null) attributes[name] = v;
    }
    const tag = el.tagName.toLowerCase();
    let currentValue = el.value || '';
    if (tag === 'select') currentValue = el.selectedOptions[0]?.text || '';
    if (grouped) currentValue = el.checked ? optionText(el) : '';
    const field = {
      selector: selectorFor(el, 'f'),
      tag,
      inputType: type,
      label: (grouped ? groupLabel(el) : labelFor(el)).slice(0, 200),
      placeholder: el.getAttribute('placeholder') || '',
      required: el.required || el.getAttribute('aria-required') === 'true',
      currentValue,
      attributes,
      nearbyText: nearby(el),
      options: tag === 'select'
        ? [...el.options].map(o => o.text.trim()).filter(t => t)
        : grouped ? [optionText(el)] : [],
    };
    if (grouped) radioGroups.set(el.name, field);
    fields.push(field);
  }

  const submit = [...document.querySelectorAll('button, input[type=submit]')].find(b => {
    if (!isVisible(b)) return false;
    const text = (b.innerText || b.value || '').toLowerCase();
    return b.type === 'submit' || /submit|apply|send application/.test(text);
  });

  return JSON.stringify({
    context: {
      url: window.location.href,
      title: document.title,
      formCount: document.forms.length,
    },
    fields,
    submitSelector: submit ? selectorFor(submit, 's') : null,
  });
})()
"#;

/// Capture the form fields on the current page.
pub fn capture_snapshot(tab: &Arc<Tab>) -> Result<PageSnapshot> {
    let result = tab.evaluate(SNAPSHOT_JS, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .context("snapshot script returned nothing")?;
    serde_json::from_str(&raw).context("snapshot script returned malformed JSON")
}

/// Quote a selector for embedding in a single-quoted JS string.
pub fn js_string(selector: &str) -> String {
    selector.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Radios in the same group as `el`, with the text each is offered under.
const RADIO_GROUP_JS: &str = "const radios = [...(el.form || document).querySelectorAll('input[type=radio]')] \
     .filter(r => r.name === el.name); \
     const text = r => ((r.labels && r.labels[0] && r.labels[0].innerText) || r.value || '').trim();";

/// Read a field's current value (selected option text for selects and radio groups).
pub fn read_value(tab: &Arc<Tab>, selector: &str) -> Result<String> {
    let js = format!(
        "(() => {{ const el = document.querySelector('{sel}'); \
         if (!el) throw new Error('No element found for {sel}'); \
         if (el.tagName === 'SELECT') return el.selectedOptions[0]?.text || ''; \
         if (el.type === 'radio' && el.name) {{ {RADIO_GROUP_JS} \
           const picked = radios.find(r => r.checked); return picked ? text(picked) : ''; }} \
         return el.value || ''; }})()",
        sel = js_string(selector)
    );
    let result = tab.evaluate(&js, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// Pick the option whose text or value matches, and fire the change event frameworks listen for.
/// For a radio group the matching radio is clicked.
pub fn select_option(tab: &Arc<Tab>, selector: &str, wanted: &str) -> Result<bool> {
    let js = format!(
        "(() => {{ const el = document.querySelector('{sel}'); \
         if (!el) throw new Error('No element found'); \
         const want = '{want}'.toLowerCase(); \
         if (el.type === 'radio' && el.name) {{ {RADIO_GROUP_JS} \
           const pick = radios.find(r => text(r).toLowerCase() === want || r.value.toLowerCase() === want); \
           if (!pick) return false; \
           pick.click(); \
           return pick.checked; }} \
         const opt = [...el.options].find(o => o.text.trim().toLowerCase() === want || o.value.toLowerCase() === want); \
         if (!opt) return false; \
         el.value = opt.value; \
         el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
         el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
         return true; }})()",
        sel = js_string(selector),
        want = js_string(wanted.trim()),
    );
    let result = tab.evaluate(&js, false)?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}
