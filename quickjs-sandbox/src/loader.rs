//! Loader shim evaluated inside QuickJS before any user code.
//!
//! The shim hardens the global environment (frozen intrinsics, trapped
//! globals, gas-charged timers), installs the host bindings over the
//! native `__sealvm_hostcall` bridge, then evaluates the user script and
//! calls `main(input)`. Results and errors are written to `/work/out.json`
//! so the embedder never has to parse interpreter output.

pub(crate) const LOADER_NAME: &str = "loader.mjs";
pub(crate) const CODE_NAME: &str = "code.js";
pub(crate) const INPUT_NAME: &str = "input.json";
pub(crate) const OUT_NAME: &str = "out.json";

// Module mode; `std`/`os` come from quickjs-libc. The native hostcall
// bridge must be installed by the QuickJS build before module evaluation.
pub(crate) const LOADER_MJS: &str = r#"
import * as std from 'std';
import * as os from 'os';

const G = globalThis;

function readFile(path) {
  const f = std.open(path, 'rb');
  if (!f) throw new Error('open failed: ' + path);
  const s = f.readAsString();
  f.close();
  return s;
}
function writeFile(path, content) {
  const f = std.open(path, 'wb');
  if (!f) throw new Error('open failed: ' + path);
  f.puts(content);
  f.close();
}

const WORK = '/work';
const CODE_PATH = WORK + '/code.js';
const INPUT_PATH = WORK + '/input.json';
const OUT_PATH = WORK + '/out.json';

function writeOut(obj) {
  writeFile(OUT_PATH, JSON.stringify(obj));
}

class SecurityError extends Error {
  constructor(message) {
    super(message);
    this.name = 'SecurityError';
  }
}
G.SecurityError = SecurityError;

// Native bridge installed by the embedding QuickJS build. Captured and
// removed so user code can never reach it directly.
const bridge = G.__sealvm_hostcall;
delete G.__sealvm_hostcall;
if (typeof bridge !== 'function') {
  writeOut({ ok: false, name: 'SystemError', message: 'host bridge unavailable' });
  std.exit(1);
}

function hostCall(request) {
  const resp = JSON.parse(bridge(JSON.stringify(request)));
  if (!resp.ok) {
    const e = resp.kind === 'SecurityError'
      ? new SecurityError(resp.message)
      : new Error(resp.message);
    if (resp.kind !== 'SecurityError') e.name = resp.kind;
    throw e;
  }
  return resp.value;
}

// --- host bindings ---

G.getSecret = function getSecret(name) {
  return hostCall({ fn: 'getSecret', name: String(name) });
};
G.log = function log(message) {
  hostCall({ fn: 'log', message: String(message) });
};
G.verifyData = function verifyData(data, signature) {
  return hostCall({ fn: 'verifyData', data: String(data), signature: String(signature) });
};
G.generateRandomBytes = function generateRandomBytes(n) {
  const bytes = hostCall({ fn: 'randomBytes', count: n >>> 0 });
  return new Uint8Array(bytes);
};

// --- timers: charge on arm and on every fire ---

const rawSetTimeout = os.setTimeout;
const rawClearTimeout = os.clearTimeout;

G.setTimeout = function setTimeout(callback, delay) {
  if (typeof callback !== 'function') throw new TypeError('callback must be a function');
  const ms = delay >>> 0;
  hostCall({ fn: 'timerArmed', delay: ms });
  return rawSetTimeout(function () {
    hostCall({ fn: 'timerFired' });
    callback();
  }, ms);
};
G.clearTimeout = function clearTimeout(handle) {
  rawClearTimeout(handle);
};

G.setInterval = function setInterval(callback, delay) {
  if (typeof callback !== 'function') throw new TypeError('callback must be a function');
  const ms = delay >>> 0;
  const handle = { cleared: false, id: 0 };
  const tickFn = function () {
    if (handle.cleared) return;
    hostCall({ fn: 'timerFired' });
    try {
      callback();
    } finally {
      if (!handle.cleared) {
        hostCall({ fn: 'timerArmed', delay: ms });
        handle.id = rawSetTimeout(tickFn, ms);
      }
    }
  };
  hostCall({ fn: 'timerArmed', delay: ms });
  handle.id = rawSetTimeout(tickFn, ms);
  return handle;
};
G.clearInterval = function clearInterval(handle) {
  if (handle && typeof handle === 'object') {
    handle.cleared = true;
    rawClearTimeout(handle.id);
  } else {
    rawClearTimeout(handle);
  }
};

// --- frozen intrinsics (before the traps below shadow their names) ---

const INTRINSICS = [
  Object, Array, String, Number, Boolean, Function, Date, RegExp,
  Error, Math, JSON, SecurityError,
];
for (const intrinsic of INTRINSICS) {
  if (intrinsic.prototype) Object.freeze(intrinsic.prototype);
  Object.freeze(intrinsic);
}

// --- forbidden globals ---

const FORBIDDEN = [
  'document', 'window', 'globalThis', 'XMLHttpRequest', 'fetch',
  'WebSocket', 'Worker', 'eval', 'Function', 'Proxy', 'constructor',
];
for (const name of FORBIDDEN) {
  Object.defineProperty(G, name, {
    configurable: false,
    get() { throw new SecurityError(name + ' is not available'); },
    set() { throw new SecurityError(name + ' is not available'); },
  });
}

// --- evaluate user code and invoke the entry point ---

let input = null;
try {
  input = JSON.parse(readFile(INPUT_PATH));
} catch (e) {
  writeOut({ ok: false, name: 'SystemError', message: 'input unreadable: ' + String(e) });
  std.exit(1);
}

const source = readFile(CODE_PATH);
try {
  std.evalScript(source);
} catch (e) {
  writeOut({ ok: false, name: (e && e.name) || 'SyntaxError', message: String((e && e.message) || e) });
  std.exit(0);
}

const entry = G.main;
if (typeof entry !== 'function') {
  writeOut({ ok: false, name: 'ScriptError', message: 'main is not a function' });
  std.exit(0);
}

let result;
try {
  result = entry(input);
} catch (e) {
  writeOut({ ok: false, name: (e && e.name) || 'Error', message: String((e && e.message) || e) });
  std.exit(0);
}

try {
  writeOut({ ok: true, result: result === undefined ? null : result });
} catch (e) {
  writeOut({ ok: false, name: 'ScriptError', message: 'result not serializable: ' + String(e) });
}
"#;
